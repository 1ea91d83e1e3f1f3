pub mod events;
pub mod pile;
pub mod session;
pub mod types;

pub use events::*;
pub use pile::*;
pub use session::*;
pub use types::*;
