//! Client data core for the gingham grid: tile cache with gap detection,
//! viewport subscription reconciliation, a reconnecting transport, and an
//! offline outbox, glued together by a session task. Rendering and HUD
//! concerns live elsewhere; this crate only keeps the data converging.

pub mod outbox;
pub mod reconciler;
pub mod session;
pub mod store;
pub mod transport;

pub use reconciler::{CameraRect, Reconciler};
pub use session::{SessionEvent, SessionHandle, start};
pub use store::{Applied, TileStore};
pub use transport::{Transport, TransportEvent};
