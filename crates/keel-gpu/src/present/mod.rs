//! Presentation of finished back buffers to the platform.
//!
//! The headless target lives in [`crate::hal`]; this module adds the window
//! surface.

mod window;

pub use window::{PresenterInit, SurfaceErrorAction, WindowPresenter};
