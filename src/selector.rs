//! Output stream selection.

use crate::traits::{ExposureMode, Size};

/// Output size and exposure mode the session will run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedStreamConfig {
    /// Chosen output size.
    pub size: Size,
    /// Exposure mode applied to the repeating request.
    pub exposure: ExposureMode,
}

/// Pick an output size.
///
/// Without a target height the largest area wins; with one, the height
/// closest to the target wins. Ties keep the earliest candidate, so the
/// result only depends on the order `sizes` is given in. Returns `None` for
/// an empty list.
pub fn select_output_size(sizes: &[Size], target_height: Option<u32>) -> Option<Size> {
    let mut iter = sizes.iter().copied();
    let first = iter.next()?;

    let best = match target_height {
        None => iter.fold(first, |best, size| {
            if size.area() > best.area() {
                size
            } else {
                best
            }
        }),
        Some(target) => iter.fold(first, |best, size| {
            if size.height.abs_diff(target) < best.height.abs_diff(target) {
                size
            } else {
                best
            }
        }),
    };
    Some(best)
}

/// The requested exposure mode if the device supports it, `Off` otherwise.
pub fn effective_exposure(requested: ExposureMode, supported: &[ExposureMode]) -> ExposureMode {
    if supported.contains(&requested) {
        requested
    } else {
        ExposureMode::Off
    }
}
