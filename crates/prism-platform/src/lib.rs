// SPDX-License-Identifier: CEPL-1.0

//! Window-system boundary. Everything above this crate reaches winit
//! through this re-export, so the windowing service stays swappable.

pub use winit;
