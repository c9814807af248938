//! GTK4 host adapters.
//!
//! This module provides:
//! - `GlibScheduler` - Scheduler backed by the glib main loop
//! - `GtkGridSurface` - `gtk4::Fixed` inside a `ScrolledWindow` as render surface and scroll container
//! - `GtkZoomStyle` - Zoom classes on the grid widget
//! - `GtkMediaBackend` - `gtk4::MediaFile` / `gtk4::Picture` media elements

pub mod glib_scheduler;
pub mod gtk_media;
pub mod gtk_surface;

pub use glib_scheduler::GlibScheduler;
pub use gtk_media::{GtkMediaBackend, GtkMediaElement};
pub use gtk_surface::{GtkGridSurface, GtkZoomStyle};
