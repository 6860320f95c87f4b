//! Polygon references
//!
//! A [`PolyRef`] packs `salt | tile | poly` into one 64-bit value. The bit
//! widths are chosen when the navigation mesh is created and held by a
//! [`RefLayout`]. The salt is bumped every time a tile slot is reused, which
//! lets lookups reject references to tiles that have since been unloaded.

use nav_common::{Error, Result};

/// Width of the packed identifier in bits
pub const REF_BITS: u32 = 64;

/// Fewest salt bits a layout may leave
pub const MIN_SALT_BITS: u32 = 10;

/// Widest tile or poly index field
pub const MAX_INDEX_BITS: u32 = 32;

/// Opaque reference to a polygon in a loaded tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyRef(u64);

impl PolyRef {
    /// The null reference; never refers to a polygon
    pub const NULL: PolyRef = PolyRef(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw packed value
    pub fn id(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Non-null. Says nothing about whether the polygon is still loaded.
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for PolyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PolyRef({:#x})", self.0)
    }
}

/// The three fields of a decoded reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedRef {
    pub salt: u32,
    pub tile: u32,
    pub poly: u32,
}

/// Bit layout shared by every reference of one navigation mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefLayout {
    salt_bits: u32,
    tile_bits: u32,
    poly_bits: u32,
}

impl RefLayout {
    /// Creates a layout, failing when the fields do not fit the identifier
    pub fn new(tile_bits: u32, poly_bits: u32) -> Result<Self> {
        if tile_bits == 0 || tile_bits > MAX_INDEX_BITS {
            return Err(Error::InvalidParam(format!(
                "tile bits must be in 1..={MAX_INDEX_BITS}, got {tile_bits}"
            )));
        }
        if poly_bits == 0 || poly_bits > MAX_INDEX_BITS {
            return Err(Error::InvalidParam(format!(
                "poly bits must be in 1..={MAX_INDEX_BITS}, got {poly_bits}"
            )));
        }
        let used = tile_bits + poly_bits;
        if used + MIN_SALT_BITS > REF_BITS {
            return Err(Error::InvalidParam(format!(
                "{tile_bits} tile and {poly_bits} poly bits leave under {MIN_SALT_BITS} salt bits"
            )));
        }
        Ok(Self {
            salt_bits: (REF_BITS - used).min(32),
            tile_bits,
            poly_bits,
        })
    }

    pub fn salt_bits(&self) -> u32 {
        self.salt_bits
    }

    pub fn tile_bits(&self) -> u32 {
        self.tile_bits
    }

    pub fn poly_bits(&self) -> u32 {
        self.poly_bits
    }

    /// Number of addressable tile slots
    pub fn max_tiles(&self) -> u64 {
        1u64 << self.tile_bits
    }

    /// Number of addressable polygons per tile
    pub fn max_polys(&self) -> u64 {
        1u64 << self.poly_bits
    }

    pub fn salt_mask(&self) -> u32 {
        mask(self.salt_bits) as u32
    }

    /// Packs the fields; out-of-range values are masked
    pub fn encode(&self, salt: u32, tile: u32, poly: u32) -> PolyRef {
        let salt = u64::from(salt) & mask(self.salt_bits);
        let tile = u64::from(tile) & mask(self.tile_bits);
        let poly = u64::from(poly) & mask(self.poly_bits);
        PolyRef((salt << (self.poly_bits + self.tile_bits)) | (tile << self.poly_bits) | poly)
    }

    pub fn decode(&self, reference: PolyRef) -> DecodedRef {
        let id = reference.0;
        DecodedRef {
            salt: ((id >> (self.poly_bits + self.tile_bits)) & mask(self.salt_bits)) as u32,
            tile: ((id >> self.poly_bits) & mask(self.tile_bits)) as u32,
            poly: (id & mask(self.poly_bits)) as u32,
        }
    }

    /// Salt to use after `salt` when a slot is recycled; never zero
    pub fn next_salt(&self, salt: u32) -> u32 {
        let next = salt.wrapping_add(1) & self.salt_mask();
        if next == 0 {
            1
        } else {
            next
        }
    }
}

#[inline]
fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}
