//! Minimum bounding rectangles and the geometry kernel
//!
//! Every predicate is a pure function over two boxes. Comparisons take an
//! optional [`SpatialRef`]; with one present its tolerance is applied as
//! slack on every bound, without one the comparison is exact.

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Number of spatial dimensions
pub const DIMS: usize = 2;

/// Encoded size of an MBR: `2 * DIMS` little-endian doubles
pub const MBR_ENCODED_SIZE: usize = 2 * DIMS * 8;

/// Finite stand-in for areas that would overflow to infinity
pub const AREA_SATURATED: f64 = f64::MAX / 4.0;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mbr {
    /// Lower bound per axis
    pub min: [f64; DIMS],
    /// Upper bound per axis
    pub max: [f64; DIMS],
}

/// Coordinate system descriptor for comparisons
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialRef {
    /// Spatial reference system identifier
    pub srid: u32,
    /// Slack applied to every bound comparison
    pub tolerance: f64,
}

impl SpatialRef {
    /// Create a spatial reference with a comparison tolerance
    pub fn new(srid: u32, tolerance: f64) -> Self {
        Self { srid, tolerance }
    }

    /// Check the tolerance is usable
    pub fn validate(&self) -> Result<()> {
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(Error::InvalidParameter("spatial reference tolerance must be finite and >= 0"));
        }
        Ok(())
    }
}

#[inline]
fn slack(srs: Option<&SpatialRef>) -> f64 {
    srs.map_or(0.0, |s| s.tolerance)
}

impl Mbr {
    /// Create a box from per-axis bounds
    pub const fn new(min: [f64; DIMS], max: [f64; DIMS]) -> Self {
        Self { min, max }
    }

    /// Create a 2-D box from its lower-left and upper-right corners
    pub const fn rect(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self { min: [xmin, ymin], max: [xmax, ymax] }
    }

    /// Create a degenerate box for a single point
    pub const fn point(x: f64, y: f64) -> Self {
        Self { min: [x, y], max: [x, y] }
    }

    /// Reject NaN or inverted bounds
    pub fn validate(&self) -> Result<()> {
        for axis in 0..DIMS {
            let (lo, hi) = (self.min[axis], self.max[axis]);
            if lo.is_nan() || hi.is_nan() {
                return Err(Error::InvalidMbr(format!("NaN bound on axis {}", axis).into()));
            }
            if lo > hi {
                return Err(Error::InvalidMbr(
                    format!("inverted bounds on axis {}: {} > {}", axis, lo, hi).into(),
                ));
            }
        }
        Ok(())
    }

    /// Product of the axis extents
    pub fn area(&self) -> f64 {
        area(self)
    }

    /// Whether the box has zero area (a point or a line)
    pub fn is_degenerate(&self) -> bool {
        (0..DIMS).any(|axis| self.min[axis] == self.max[axis])
    }

    /// Smallest box enclosing both
    pub fn join(&self, other: &Mbr) -> Mbr {
        join(self, other)
    }

    /// Union of a sequence of boxes, `None` when empty
    pub fn union_all<'a>(mut boxes: impl Iterator<Item = &'a Mbr>) -> Option<Mbr> {
        let first = *boxes.next()?;
        Some(boxes.fold(first, |acc, b| join(&acc, b)))
    }

    /// Total order over the encoded coordinates, axis by axis
    pub fn sort_cmp(&self, other: &Mbr) -> Ordering {
        for axis in 0..DIMS {
            let ord = self.min[axis]
                .total_cmp(&other.min[axis])
                .then_with(|| self.max[axis].total_cmp(&other.max[axis]));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Write the box as `xmin, xmax, ymin, ymax`
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= MBR_ENCODED_SIZE);
        for axis in 0..DIMS {
            let at = axis * 16;
            LittleEndian::write_f64(&mut buf[at..at + 8], self.min[axis]);
            LittleEndian::write_f64(&mut buf[at + 8..at + 16], self.max[axis]);
        }
    }

    /// Read a box written by [`Mbr::encode_into`]
    pub fn decode(buf: &[u8]) -> Result<Mbr> {
        if buf.len() < MBR_ENCODED_SIZE {
            return Err(Error::Decoding("truncated MBR".into()));
        }
        let mut mbr = Mbr::new([0.0; DIMS], [0.0; DIMS]);
        for axis in 0..DIMS {
            let at = axis * 16;
            mbr.min[axis] = LittleEndian::read_f64(&buf[at..at + 8]);
            mbr.max[axis] = LittleEndian::read_f64(&buf[at + 8..at + 16]);
        }
        Ok(mbr)
    }
}

/// `a` encloses `b` on every axis
pub fn contains(a: &Mbr, b: &Mbr, srs: Option<&SpatialRef>) -> bool {
    let tol = slack(srs);
    (0..DIMS).all(|axis| a.min[axis] <= b.min[axis] + tol && a.max[axis] + tol >= b.max[axis])
}

/// `a` lies inside `b`
pub fn within(a: &Mbr, b: &Mbr, srs: Option<&SpatialRef>) -> bool {
    contains(b, a, srs)
}

/// Same bounds on every axis
pub fn equals(a: &Mbr, b: &Mbr, srs: Option<&SpatialRef>) -> bool {
    let tol = slack(srs);
    (0..DIMS).all(|axis| {
        (a.min[axis] - b.min[axis]).abs() <= tol && (a.max[axis] - b.max[axis]).abs() <= tol
    })
}

/// Overlap (non-strict) on every axis
pub fn intersects(a: &Mbr, b: &Mbr, srs: Option<&SpatialRef>) -> bool {
    let tol = slack(srs);
    (0..DIMS).all(|axis| a.min[axis] <= b.max[axis] + tol && b.min[axis] <= a.max[axis] + tol)
}

/// No overlap on at least one axis
pub fn disjoint(a: &Mbr, b: &Mbr, srs: Option<&SpatialRef>) -> bool {
    !intersects(a, b, srs)
}

/// Axis-wise min of mins and max of maxes
pub fn join(a: &Mbr, b: &Mbr) -> Mbr {
    let mut out = *a;
    for axis in 0..DIMS {
        out.min[axis] = a.min[axis].min(b.min[axis]);
        out.max[axis] = a.max[axis].max(b.max[axis]);
    }
    out
}

/// Product of the axis extents, saturated when it overflows
pub fn area(a: &Mbr) -> f64 {
    let product: f64 = (0..DIMS).map(|axis| a.max[axis] - a.min[axis]).product();
    if product.is_finite() {
        product
    } else {
        AREA_SATURATED
    }
}

/// Growth of `existing` needed to absorb `candidate`, and the grown area
///
/// Both values saturate to [`AREA_SATURATED`] instead of reaching infinity,
/// so candidates far apart still rank against each other.
pub fn area_increase(existing: &Mbr, candidate: &Mbr) -> (f64, f64) {
    let new_area = area(&join(existing, candidate));
    let increase = new_area - area(existing);
    if !increase.is_finite() || new_area >= AREA_SATURATED {
        return (AREA_SATURATED, AREA_SATURATED);
    }
    (increase.max(0.0), new_area)
}

/// Area of the intersection, 0 when disjoint
pub fn overlap_area(a: &Mbr, b: &Mbr) -> f64 {
    let mut product = 1.0;
    for axis in 0..DIMS {
        let lo = a.min[axis].max(b.min[axis]);
        let hi = a.max[axis].min(b.max[axis]);
        if hi <= lo {
            return 0.0;
        }
        product *= hi - lo;
    }
    if product.is_finite() {
        product
    } else {
        AREA_SATURATED
    }
}
