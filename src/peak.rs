use std::cmp::Ordering;
use std::fmt;

use mzpeaks::peak::MZPoint;
use mzpeaks::{CoordinateLike, IndexedCoordinate, IntensityMeasurement, MZPeakSetType, MZ};

/// A collection of detected peaks sorted by mass
pub type PeakList = MZPeakSetType<DetectedPeak>;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
/// A [`DetectedPeak`] implements the [`CoordinateLike`](https://docs.rs/mzpeaks/latest/mzpeaks/coordinate/trait.CoordinateLike.html)
/// trait with a mass-over-charge coordinate, and records where it was found in the
/// spectrum along with the strength of the curvature that singled it out.
pub struct DetectedPeak {
    pub mz: f64,
    /// The smoothed signal at the peak apex
    pub intensity: f32,
    /// The position of this peak in its [`PeakList`]
    pub index: u32,

    /// The sample of the analysed spectrum closest to the apex
    pub sample_index: usize,
    /// The height of the scaled negative second derivative at the apex
    pub curvature: f64,
    /// The width of the curvature peak at half prominence, in mass units
    pub width: f64,
}

impl DetectedPeak {
    pub fn new(
        mz: f64,
        intensity: f32,
        sample_index: usize,
        curvature: f64,
        width: f64,
    ) -> Self {
        Self {
            mz,
            intensity,
            index: 0,
            sample_index,
            curvature,
            width,
        }
    }
}

impl PartialOrd for DetectedPeak {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.mz.partial_cmp(&other.mz) {
            Some(Ordering::Equal) => {}
            ord => return ord,
        }
        match self.intensity.partial_cmp(&other.intensity) {
            Some(Ordering::Equal) => {}
            ord => return ord,
        }
        self.sample_index.partial_cmp(&other.sample_index)
    }
}

impl CoordinateLike<MZ> for DetectedPeak {
    #[inline]
    fn coordinate(&self) -> f64 {
        self.mz
    }
}

impl IndexedCoordinate<MZ> for DetectedPeak {
    #[inline]
    fn get_index(&self) -> mzpeaks::IndexType {
        self.index
    }

    #[inline]
    fn set_index(&mut self, index: mzpeaks::IndexType) {
        self.index = index
    }
}

impl IntensityMeasurement for DetectedPeak {
    #[inline]
    fn intensity(&self) -> f32 {
        self.intensity
    }
}

impl From<DetectedPeak> for MZPoint {
    fn from(peak: DetectedPeak) -> Self {
        Self {
            mz: peak.coordinate(),
            intensity: peak.intensity(),
        }
    }
}

impl fmt::Display for DetectedPeak {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "DetectedPeak({:.6}, {}, {}, {:.4e}, {:.4e})",
            self.mz, self.intensity, self.index, self.curvature, self.width
        )
    }
}
