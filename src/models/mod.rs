pub mod instance;
pub mod network;
pub mod settings;
pub mod status;

pub use instance::*;
pub use network::*;
pub use settings::*;
pub use status::*;
