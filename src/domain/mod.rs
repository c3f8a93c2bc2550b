pub mod order;
pub mod signal;
pub mod state;
pub mod task;
pub mod trade;

pub use order::*;
pub use signal::*;
pub use state::*;
pub use task::*;
pub use trade::*;
