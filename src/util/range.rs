//! Rectangle algebra over image sub-resource ranges.
//!
//! A [`vk::ImageSubresourceRange`] is treated as a rectangle spanning array layers on one axis and
//! mip levels on the other. All functions in this module expect resolved ranges, i.e. ranges that
//! do not use [`vk::REMAINING_ARRAY_LAYERS`] or [`vk::REMAINING_MIP_LEVELS`].

use ash::vk;

/// Result of cutting one range by another.
#[derive(Clone, Debug)]
pub struct CutRange {
    /// The part of the source range covered by the cut range. [`None`] if the two do not overlap.
    pub intersection: Option<vk::ImageSubresourceRange>,

    /// Parts of the source range not covered by the cut range. Together with the intersection
    /// these partition the source range. At most 4 entries.
    pub remainders: Vec<vk::ImageSubresourceRange>,
}

#[inline]
fn layer_bounds(range: &vk::ImageSubresourceRange) -> (u32, u32) {
    (range.base_array_layer, range.base_array_layer + range.layer_count)
}

#[inline]
fn mip_bounds(range: &vk::ImageSubresourceRange) -> (u32, u32) {
    (range.base_mip_level, range.base_mip_level + range.level_count)
}

#[inline]
fn make_range(aspect_mask: vk::ImageAspectFlags, layers: (u32, u32), mips: (u32, u32)) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: mips.0,
        level_count: mips.1 - mips.0,
        base_array_layer: layers.0,
        layer_count: layers.1 - layers.0,
    }
}

/// Field wise equality. The aspect mask is part of the comparison.
pub fn ranges_equal(a: &vk::ImageSubresourceRange, b: &vk::ImageSubresourceRange) -> bool {
    a.aspect_mask == b.aspect_mask &&
        a.base_mip_level == b.base_mip_level &&
        a.level_count == b.level_count &&
        a.base_array_layer == b.base_array_layer &&
        a.layer_count == b.layer_count
}

/// Returns true if the two ranges share at least one sub-resource. Aspects are ignored.
pub fn ranges_overlap(a: &vk::ImageSubresourceRange, b: &vk::ImageSubresourceRange) -> bool {
    let (a_l0, a_l1) = layer_bounds(a);
    let (b_l0, b_l1) = layer_bounds(b);
    let (a_m0, a_m1) = mip_bounds(a);
    let (b_m0, b_m1) = mip_bounds(b);

    a_l0 < b_l1 && b_l0 < a_l1 && a_m0 < b_m1 && b_m0 < a_m1
}

/// Returns true if every sub-resource of `inner` is also part of `outer`.
pub fn range_contains(outer: &vk::ImageSubresourceRange, inner: &vk::ImageSubresourceRange) -> bool {
    let (o_l0, o_l1) = layer_bounds(outer);
    let (i_l0, i_l1) = layer_bounds(inner);
    let (o_m0, o_m1) = mip_bounds(outer);
    let (i_m0, i_m1) = mip_bounds(inner);

    o_l0 <= i_l0 && i_l1 <= o_l1 && o_m0 <= i_m0 && i_m1 <= o_m1
}

/// Returns true if the range contains the sub-resource at the specified layer and mip level.
pub fn range_contains_subresource(range: &vk::ImageSubresourceRange, layer: u32, mip: u32) -> bool {
    let (l0, l1) = layer_bounds(range);
    let (m0, m1) = mip_bounds(range);

    l0 <= layer && layer < l1 && m0 <= mip && mip < m1
}

pub fn range_subresource_count(range: &vk::ImageSubresourceRange) -> u32 {
    range.layer_count * range.level_count
}

/// Cuts `source` by `cut`.
///
/// The source is first split along the layer axis into the band of layers shared with the cut
/// and the layers above and below it. The shared band is then split along the mip axis. All
/// produced ranges keep the aspect mask of the source.
pub fn cut_range(source: &vk::ImageSubresourceRange, cut: &vk::ImageSubresourceRange) -> CutRange {
    if !ranges_overlap(source, cut) {
        return CutRange {
            intersection: None,
            remainders: vec![*source],
        };
    }

    let aspect = source.aspect_mask;
    let (s_l0, s_l1) = layer_bounds(source);
    let (c_l0, c_l1) = layer_bounds(cut);
    let (s_m0, s_m1) = mip_bounds(source);
    let (c_m0, c_m1) = mip_bounds(cut);

    let l0 = s_l0.max(c_l0);
    let l1 = s_l1.min(c_l1);
    let m0 = s_m0.max(c_m0);
    let m1 = s_m1.min(c_m1);

    let mut remainders = Vec::with_capacity(4);
    if s_l0 < l0 {
        remainders.push(make_range(aspect, (s_l0, l0), (s_m0, s_m1)));
    }
    if l1 < s_l1 {
        remainders.push(make_range(aspect, (l1, s_l1), (s_m0, s_m1)));
    }
    if s_m0 < m0 {
        remainders.push(make_range(aspect, (l0, l1), (s_m0, m0)));
    }
    if m1 < s_m1 {
        remainders.push(make_range(aspect, (l0, l1), (m1, s_m1)));
    }

    CutRange {
        intersection: Some(make_range(aspect, (l0, l1), (m0, m1))),
        remainders,
    }
}

/// Subtracts every range in `cuts` from `source` and returns the uncovered parts.
pub fn subtract_ranges<'a, I>(source: &vk::ImageSubresourceRange, cuts: I) -> Vec<vk::ImageSubresourceRange>
    where I: IntoIterator<Item = &'a vk::ImageSubresourceRange> {

    let mut uncovered = vec![*source];
    for cut in cuts {
        let mut next = Vec::with_capacity(uncovered.len());
        for range in uncovered.iter() {
            next.extend(cut_range(range, cut).remainders);
        }
        uncovered = next;

        if uncovered.is_empty() {
            break;
        }
    }
    uncovered
}
