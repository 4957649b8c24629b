use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 64;

/// Events shared between the player widget and its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetEvent {
    /// Ask the player to show its full view.
    ExpandPlayer,
    /// The player's intended play state changed.
    PlayStateChanged { is_playing: bool },
}

/// Typed broadcast channel. Cloning shares the same bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WidgetEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publishing with no listeners is not an error.
    pub fn publish(&self, event: WidgetEvent) {
        if self.sender.send(event).is_err() {
            log::debug!("No bus listeners for {:?}", event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WidgetEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
