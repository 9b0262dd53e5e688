//! Range filters for multicast traffic
//!
//! Positions and `@` messages only reach clients within visual range.
//! Distances are great-circle distances in nautical miles.

use fsd9_core::types::PositionReport;
use fsd9_core::ClientKind;

/// Mean Earth radius in nautical miles
const EARTH_RADIUS_NM: f64 = 3440.065;

/// What a range check needs to know about one client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Presence {
    pub kind: ClientKind,
    pub position: Option<PositionReport>,
}

impl Presence {
    fn valid_position(&self) -> Option<&PositionReport> {
        self.position.as_ref().filter(|p| p.is_valid())
    }

    /// Default visual range of the client in nautical miles.
    ///
    /// Pilots see further the higher they fly; controllers by facility type.
    pub fn range(&self) -> f64 {
        match self.kind {
            ClientKind::Pilot => {
                let altitude = self.position.map(|p| p.altitude.max(0)).unwrap_or(0);
                (10.0 + 1.414 * f64::from(altitude).sqrt()).trunc()
            }
            ClientKind::Atc => match self.position.and_then(|p| p.facility) {
                Some(2) | Some(3) => 5.0,
                Some(4) => 30.0,
                Some(5) => 100.0,
                Some(6) => 400.0,
                Some(1) | Some(7) => 1500.0,
                _ => 40.0,
            },
        }
    }
}

/// Haversine distance between two positions.
pub fn distance_nm(from: &PositionReport, to: &PositionReport) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let delta_lat = (to.latitude - from.latitude).to_radians();
    let delta_lon = (to.longitude - from.longitude).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_NM * c
}

/// Distance between both clients if both have a usable position.
fn distance(from: &Presence, to: &Presence) -> Option<f64> {
    Some(distance_nm(from.valid_position()?, to.valid_position()?))
}

/// Filter for position broadcasts.
///
/// A controller receiving sees as far as the range it declared. Between
/// pilots the two ranges add up; otherwise the larger one counts.
pub fn position_in_range(from: &Presence, to: &Presence) -> bool {
    let Some(distance) = distance(from, to) else {
        return false;
    };

    let (x, y) = (to.range(), from.range());
    let range = match (from.kind, to.kind) {
        (_, ClientKind::Atc) => to
            .position
            .and_then(|p| p.visual_range)
            .map(f64::from)
            .unwrap_or(x),
        (ClientKind::Pilot, ClientKind::Pilot) => x + y,
        _ => x.max(y),
    };
    distance < range
}

/// Filter for `@` text messages: ranges add up between pilots, otherwise the
/// larger one counts.
pub fn message_in_range(from: &Presence, to: &Presence) -> bool {
    let Some(distance) = distance(from, to) else {
        return false;
    };

    let (x, y) = (to.range(), from.range());
    let range = match (from.kind, to.kind) {
        (ClientKind::Pilot, ClientKind::Pilot) => x + y,
        _ => x.max(y),
    };
    distance < range
}

/// Filter for other `@` casts: within the sender's own range.
pub fn within_sender_range(from: &Presence, to: &Presence) -> bool {
    distance(from, to).is_some_and(|d| d < from.range())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pilot(lat: f64, lon: f64, alt: i32) -> Presence {
        Presence {
            kind: ClientKind::Pilot,
            position: Some(PositionReport::pilot(lat, lon, alt)),
        }
    }

    fn atc(lat: f64, lon: f64, facility: u8, visual_range: u32) -> Presence {
        Presence {
            kind: ClientKind::Atc,
            position: Some(PositionReport::atc(lat, lon, facility, visual_range)),
        }
    }

    #[test]
    fn test_one_degree_is_sixty_miles() {
        let d = distance_nm(&PositionReport::pilot(0.0, 0.0, 0), &PositionReport::pilot(1.0, 0.0, 0));
        assert!((d - 60.0).abs() < 0.5);
    }

    #[test]
    fn test_pilot_range_grows_with_altitude() {
        assert_eq!(pilot(52.0, 4.0, 0).range(), 10.0);
        assert_eq!(pilot(52.0, 4.0, 10_000).range(), 151.0);
        assert_eq!(pilot(52.0, 4.0, -500).range(), 10.0);
    }

    #[test]
    fn test_atc_range_by_facility() {
        assert_eq!(atc(52.0, 4.0, 2, 0).range(), 5.0);
        assert_eq!(atc(52.0, 4.0, 4, 0).range(), 30.0);
        assert_eq!(atc(52.0, 4.0, 5, 0).range(), 100.0);
        assert_eq!(atc(52.0, 4.0, 6, 0).range(), 400.0);
        assert_eq!(atc(52.0, 4.0, 7, 0).range(), 1500.0);
        assert_eq!(atc(52.0, 4.0, 0, 0).range(), 40.0);
    }

    #[test]
    fn test_position_to_pilot_adds_ranges() {
        // Both on the ground: 10 + 10 nm
        let a = pilot(52.0, 4.0, 0);
        let near = pilot(52.25, 4.0, 0);
        let far = pilot(52.5, 4.0, 0);
        assert!(position_in_range(&a, &near));
        assert!(!position_in_range(&a, &far));
    }

    #[test]
    fn test_position_to_atc_uses_declared_range() {
        let a = pilot(52.0, 4.0, 0);
        let tower = atc(52.5, 4.0, 4, 50);
        let short = atc(52.5, 4.0, 4, 20);
        assert!(position_in_range(&a, &tower));
        assert!(!position_in_range(&a, &short));
    }

    #[test]
    fn test_missing_or_invalid_position_never_in_range() {
        let a = pilot(52.0, 4.0, 0);
        let nowhere = Presence {
            kind: ClientKind::Pilot,
            position: None,
        };
        let origin = pilot(0.0, 0.0, 0);
        let orbit = pilot(52.0, 4.0, 150_000);
        assert!(!position_in_range(&a, &nowhere));
        assert!(!message_in_range(&a, &origin));
        assert!(!within_sender_range(&a, &orbit));
    }

    #[test]
    fn test_message_range_between_atc_and_pilot() {
        let center = atc(52.0, 4.0, 6, 0);
        let a = pilot(55.0, 4.0, 0);
        assert!(message_in_range(&center, &a));
        assert!(!within_sender_range(&a, &center));
    }
}
