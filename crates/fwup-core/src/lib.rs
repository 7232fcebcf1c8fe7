//! fwup-core: serial firmware update engine for multi-chip GNSS modules.
//!
//! Updates the application processor and the GNSS receiver of an LG69T
//! class module over its serial updater, and hands the STM32 bootloader off
//! to an external flashing tool.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, frame layout, device responses, per-component variants
//! - **Payload**: Firmware images and their packet sequence
//! - **Codec**: Frames for one protocol variant, response reading
//! - **FusionEngine**: Reset request / command response messages
//! - **Transport**: Serial link abstraction (serialport, mock)
//! - **State**: Session states and retry budget
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: One component update, sync to reboot
//! - **Reboot**: Automatic reset with manual fallback
//! - **Resolver**: Raw files, `.p1fw` packages and releases
//! - **Bootloader**: External flasher hand-off
//!
//! # Example
//!
//! ```no_run
//! use fwup_core::resolver::{ImageSpec, Resolver};
//! use fwup_core::session::{SessionConfig, UpdateSession};
//! use fwup_core::protocol::Component;
//! use fwup_core::transport::SerialTransport;
//!
//! let config = SessionConfig::default();
//! let images = Resolver::new()
//!     .resolve(&ImageSpec::Package {
//!         path: "lg69t-ap-1.2.0.p1fw".into(),
//!         components: vec![Component::Gnss, Component::Application],
//!     })
//!     .expect("resolve failed");
//!
//! for image in &images {
//!     let port = SerialTransport::open(&config.port, config.baud_rate).expect("open failed");
//!     UpdateSession::new(config.clone(), port)
//!         .run(image)
//!         .expect("update failed");
//! }
//! ```

pub mod bootloader;
pub mod codec;
pub mod events;
pub mod fusion;
pub mod payload;
pub mod protocol;
pub mod reboot;
pub mod resolver;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use bootloader::{ExternalFlasher, FlasherConfig, HandoffError};
pub use codec::FramingCodec;
pub use events::{NullObserver, TracingObserver, UpdateEvent, UpdateObserver};
pub use payload::{FirmwareImage, ImageFormat};
pub use protocol::{Component, DeviceResponse, ProtocolVariant};
pub use reboot::{RebootMethod, RebootStrategy};
pub use resolver::{DirectoryCatalog, ImageSpec, ReleaseCatalog, ResolveError, Resolver};
pub use session::{CancelToken, SessionConfig, SessionError, SessionReport, UpdateSession};
pub use state::{FailureKind, SessionState};
pub use transport::{MockTransport, SerialTransport, Transport, TransportError};
