//! Image feature flags as reported by the storage cluster.
//!
//! The cluster hands out a raw bitmask; this module is the only place the
//! bit assignments live.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u64)]
pub enum ImageFeature {
    Layering = 1 << 0,
    StripingV2 = 1 << 1,
    ExclusiveLock = 1 << 2,
    ObjectMap = 1 << 3,
    FastDiff = 1 << 4,
    DeepFlatten = 1 << 5,
    Journaling = 1 << 6,
}

impl ImageFeature {
    pub const ALL: [ImageFeature; 7] = [
        ImageFeature::Layering,
        ImageFeature::StripingV2,
        ImageFeature::ExclusiveLock,
        ImageFeature::ObjectMap,
        ImageFeature::FastDiff,
        ImageFeature::DeepFlatten,
        ImageFeature::Journaling,
    ];

    pub fn bit(self) -> u64 {
        self as u64
    }

    /// Canonical name, as the cluster tooling spells it.
    pub fn name(self) -> &'static str {
        match self {
            ImageFeature::Layering => "layering",
            ImageFeature::StripingV2 => "striping",
            ImageFeature::ExclusiveLock => "exclusive-lock",
            ImageFeature::ObjectMap => "object-map",
            ImageFeature::FastDiff => "fast-diff",
            ImageFeature::DeepFlatten => "deep-flatten",
            ImageFeature::Journaling => "journaling",
        }
    }
}

/// A feature bitmask. Unknown bits are preserved but never named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureSet(u64);

impl FeatureSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, feature: ImageFeature) -> bool {
        self.0 & feature.bit() != 0
    }

    pub fn with(self, feature: ImageFeature) -> Self {
        Self(self.0 | feature.bit())
    }

    /// Bits set in the mask that no known feature accounts for.
    pub fn unknown_bits(self) -> u64 {
        let known = ImageFeature::ALL.iter().fold(0, |acc, f| acc | f.bit());
        self.0 & !known
    }

    pub fn enabled(self) -> impl Iterator<Item = ImageFeature> {
        ImageFeature::ALL.into_iter().filter(move |f| self.contains(*f))
    }

    /// Every known feature mapped to whether it is enabled in this mask.
    pub fn to_map(self) -> BTreeMap<&'static str, bool> {
        ImageFeature::ALL
            .iter()
            .map(|f| (f.name(), self.contains(*f)))
            .collect()
    }

    /// Comma-joined names of the enabled features.
    pub fn describe(self) -> String {
        self.enabled().map(ImageFeature::name).collect::<Vec<_>>().join(",")
    }
}

impl From<ImageFeature> for FeatureSet {
    fn from(f: ImageFeature) -> Self {
        Self(f.bit())
    }
}

impl BitOr for ImageFeature {
    type Output = FeatureSet;

    fn bitor(self, rhs: Self) -> FeatureSet {
        FeatureSet(self.bit() | rhs.bit())
    }
}

impl BitOr<ImageFeature> for FeatureSet {
    type Output = FeatureSet;

    fn bitor(self, rhs: ImageFeature) -> FeatureSet {
        self.with(rhs)
    }
}

impl fmt::Display for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Features new images get unless told otherwise.
pub fn default_features() -> FeatureSet {
    ImageFeature::Layering | ImageFeature::ExclusiveLock | ImageFeature::ObjectMap
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_match_cluster_assignments() {
        assert_eq!(ImageFeature::Layering.bit(), 1);
        assert_eq!(ImageFeature::ObjectMap.bit(), 8);
        assert_eq!(ImageFeature::Journaling.bit(), 64);
    }

    #[test]
    fn default_features_mask() {
        let defaults = default_features();
        assert_eq!(defaults.bits(), 0b1101);
        assert!(defaults.contains(ImageFeature::Layering));
        assert!(!defaults.contains(ImageFeature::FastDiff));
    }

    #[test]
    fn map_covers_every_feature() {
        let map = FeatureSet::from_bits(0b1_0001).to_map();
        assert_eq!(map.len(), ImageFeature::ALL.len());
        assert!(map["layering"]);
        assert!(map["fast-diff"]);
        assert!(!map["journaling"]);
    }

    #[test]
    fn describe_lists_enabled_in_bit_order() {
        let set = FeatureSet::from_bits(0b0110_0001);
        assert_eq!(set.describe(), "layering,deep-flatten,journaling");
        assert_eq!(FeatureSet::empty().describe(), "");
    }

    #[test]
    fn unknown_bits_are_kept() {
        let set = FeatureSet::from_bits(1 << 40 | 1);
        assert_eq!(set.unknown_bits(), 1 << 40);
        assert_eq!(set.describe(), "layering");
    }
}
