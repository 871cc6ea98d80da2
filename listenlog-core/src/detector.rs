/// Classification of one playing observation against the last-track marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A different track (or the first one seen) is playing
    NewListen,
    /// The marker already names this track
    SameTrack,
}

/// Compare the playing track id with the last observed one.
#[must_use]
pub fn detect(current_id: &str, marker: Option<&str>) -> Transition {
    match marker {
        Some(last) if last == current_id => Transition::SameTrack,
        _ => Transition::NewListen,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_marker_is_new_listen() {
        assert_eq!(detect("t1", None), Transition::NewListen);
    }

    #[test]
    fn test_matching_marker_is_same_track() {
        assert_eq!(detect("t1", Some("t1")), Transition::SameTrack);
    }

    #[test]
    fn test_different_marker_is_new_listen() {
        assert_eq!(detect("t2", Some("t1")), Transition::NewListen);
    }
}
