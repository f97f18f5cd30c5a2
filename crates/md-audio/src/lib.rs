//! Audio output backends for the mixdown sound mixer.
//!
//! A backend opens output streams at a requested rate and drives a render
//! callback from the device's audio thread. The mixer picks one backend at
//! startup and never switches.

mod cpal_backend;
mod error;
mod manual;
mod traits;

pub use cpal_backend::CpalBackend;
pub use error::{AudioError, AudioResult};
pub use manual::ManualBackend;
pub use traits::{AudioBackend, ErrorCallback, OutputDevice, RenderCallback, StreamRequest};
