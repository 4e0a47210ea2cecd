pub mod error;
pub mod media;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod source;
pub mod transport;

pub use error::{Result, RtspError};
pub use server::{Server, ServerConfig, Viewer};
pub use session::{ClientSession, SessionDirectory, SessionState};
pub use source::{SourceObserver, SourceRegistry, SourceStream, SourceTrack};
