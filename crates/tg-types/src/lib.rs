pub mod market;
pub mod position;
pub mod group;
pub mod snapshot;
pub mod events;
pub mod errors;

pub use market::*;
pub use position::*;
pub use group::*;
pub use snapshot::*;
pub use events::*;
pub use errors::*;
