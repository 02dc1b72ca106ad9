//! Planning rules of the retarget procedure.
//!
//! The per-frame work runs inside the engine (see [`crate::script`]), but the
//! rules that decide *what* gets transferred live here as plain Rust so the
//! orchestrator can interpret what the engine reports:
//!
//! - bone mapping is the name intersection, in source order
//! - at most `max_bones` mapped bones are transferred
//! - at most `max_frames` frames are iterated, starting at the first keyframe

/// Source bone → target bone, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoneMapping {
    pairs: Vec<(String, String)>,
    unmapped: Vec<String>,
}

impl BoneMapping {
    /// Map every source bone whose name also exists in the target rig.
    ///
    /// Order follows `source`; duplicates in `source` are mapped once.
    pub fn intersect<S, T>(source: &[S], target: &[T]) -> Self
    where
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let target: std::collections::HashSet<&str> = target.iter().map(AsRef::as_ref).collect();
        let mut seen = std::collections::HashSet::new();
        let mut mapping = Self::default();
        for name in source.iter().map(AsRef::as_ref) {
            if !seen.insert(name) {
                continue;
            }
            if target.contains(name) {
                mapping.pairs.push((name.to_string(), name.to_string()));
            } else {
                mapping.unmapped.push(name.to_string());
            }
        }
        mapping
    }

    /// Source bones with no counterpart in the target.
    pub fn unmapped(&self) -> &[String] {
        &self.unmapped
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Pairs within the bone cap and the number left out.
    pub fn split_at_cap(&self, max_bones: u32) -> (&[(String, String)], usize) {
        let (kept, over) = bone_budget(self.pairs.len(), max_bones);
        (&self.pairs[..kept], over)
    }
}

/// Split `mapped` bones into (transferred, skipped) under `max_bones`.
pub fn bone_budget(mapped: usize, max_bones: u32) -> (usize, usize) {
    let cap = max_bones as usize;
    if mapped > cap {
        (cap, mapped - cap)
    } else {
        (mapped, 0)
    }
}

/// The inclusive frame window actually iterated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameWindow {
    pub first: i32,
    pub last: i32,
    /// Frames in the action's natural range, before clamping
    pub natural_len: u32,
}

impl FrameWindow {
    /// Clamp the keyed range `first..=last` to at most `max_frames` frames.
    ///
    /// A reversed range is treated as a single frame at `first`.
    pub fn clamp(first: i32, last: i32, max_frames: u32) -> Self {
        let natural_len = if last >= first {
            u32::try_from(i64::from(last) - i64::from(first) + 1).unwrap_or(u32::MAX)
        } else {
            1
        };
        let len = natural_len.min(max_frames.max(1));
        let last = i32::try_from(i64::from(first) + i64::from(len) - 1).unwrap_or(i32::MAX);
        Self { first, last, natural_len }
    }

    /// Frames in the clamped window. Never zero.
    pub fn frame_count(&self) -> u32 {
        u32::try_from(i64::from(self.last) - i64::from(self.first) + 1).unwrap_or(0)
    }

    pub fn truncated(&self) -> bool {
        self.natural_len > self.frame_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_is_intersection_in_source_order() {
        let source = ["root", "spine", "tail", "head", "wing.L"];
        let target = ["head", "root", "spine", "arm.L"];
        let mapping = BoneMapping::intersect(&source, &target);

        let (pairs, over) = mapping.split_at_cap(u32::MAX);
        assert_eq!(over, 0);
        let names: Vec<&str> = pairs.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(names, vec!["root", "spine", "head"]);
        assert!(pairs.iter().all(|(s, t)| s == t));
        assert_eq!(mapping.unmapped(), &["tail".to_string(), "wing.L".to_string()]);
    }

    #[test]
    fn test_mapping_disjoint_rigs() {
        let mapping = BoneMapping::intersect(&["a", "b"], &["c"]);
        assert!(mapping.is_empty());
        assert_eq!(mapping.unmapped().len(), 2);
    }

    #[test]
    fn test_mapping_ignores_duplicate_source_names() {
        let mapping = BoneMapping::intersect(&["a", "a", "b"], &["a", "b"]);
        assert_eq!(mapping.len(), 2);
    }

    #[test]
    fn test_bone_cap() {
        let names: Vec<String> = (0..5).map(|i| format!("bone{i}")).collect();
        let mapping = BoneMapping::intersect(names.as_slice(), names.as_slice());

        let (kept, over) = mapping.split_at_cap(3);
        assert_eq!(kept.len(), 3);
        assert_eq!(over, 2);
        assert_eq!(kept[2].0, "bone2");

        let (kept, over) = mapping.split_at_cap(10);
        assert_eq!(kept.len(), 5);
        assert_eq!(over, 0);
    }

    #[test]
    fn test_frame_window_within_cap() {
        let w = FrameWindow::clamp(1, 250, 10_000);
        assert_eq!(w.frame_count(), 250);
        assert!(!w.truncated());
        assert_eq!((w.first, w.last), (1, 250));
    }

    #[test]
    fn test_frame_window_truncates_from_first_keyframe() {
        let w = FrameWindow::clamp(10, 20_009, 10_000);
        assert!(w.truncated());
        assert_eq!(w.frame_count(), 10_000);
        assert_eq!(w.first, 10);
        assert_eq!(w.last, 10_009);
        assert_eq!(w.natural_len, 20_000);
    }

    #[test]
    fn test_frame_window_single_and_negative_frames() {
        let w = FrameWindow::clamp(-5, -5, 100);
        assert_eq!(w.frame_count(), 1);

        let w = FrameWindow::clamp(-10, 10, 5);
        assert_eq!((w.first, w.last), (-10, -6));

        let w = FrameWindow::clamp(7, 3, 100);
        assert_eq!(w.frame_count(), 1);
        assert_eq!(w.first, 7);
    }
}
