/// Typed notifications emitted by the controller for its observers.
///
/// Consumed from an mpsc channel by whoever drives the controller (the
/// CLI binary, tests); the controller itself never prints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Informational progress notice.
    Info(String),
    /// Something went wrong; the run continues unless the sender says
    /// otherwise through its own return value.
    Error(String),
    /// A delivery attempt finished. `total` is the number of recipients
    /// still eligible for delivery.
    QueueMoved { total: usize },
    /// The backlog drained. `total_items` is the remaining-recoverable
    /// count; zero means the run fully emptied the queue.
    QueueDone { total_items: usize },
}
