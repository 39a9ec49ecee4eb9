//! Route planner.
//!
//! Candidate city sequences come from a static table; the network of
//! operators is fixed configuration, not discovered state. Windows are laid
//! out from the departure time: each hop starts one travel leg after the
//! previous charging stop ends.

use chrono::{DateTime, Duration as TimeDelta, Utc};

use cgrid_core::types::{Segment, Window};
use cgrid_core::PlannerConfig;

/// Cities served by the network.
pub const CITIES: [&str; 5] = [
    "Salvador",
    "Feira de Santana",
    "Lençóis",
    "Juazeiro",
    "Ilhéus",
];

/// Preferred city sequence per (origin, destination) pair.
static ROUTE_TABLE: &[(&str, &str, &[&str])] = &[
    (
        "Salvador",
        "Feira de Santana",
        &["Salvador", "Lençóis", "Feira de Santana"],
    ),
    (
        "Salvador",
        "Lençóis",
        &["Salvador", "Feira de Santana", "Lençóis"],
    ),
    (
        "Salvador",
        "Ilhéus",
        &["Salvador", "Lençóis", "Juazeiro", "Ilhéus"],
    ),
    (
        "Salvador",
        "Juazeiro",
        &["Salvador", "Feira de Santana", "Ilhéus", "Juazeiro"],
    ),
    (
        "Feira de Santana",
        "Salvador",
        &["Feira de Santana", "Ilhéus", "Salvador"],
    ),
    (
        "Feira de Santana",
        "Lençóis",
        &["Feira de Santana", "Salvador", "Lençóis"],
    ),
    (
        "Feira de Santana",
        "Ilhéus",
        &["Feira de Santana", "Juazeiro", "Lençóis", "Ilhéus"],
    ),
    (
        "Feira de Santana",
        "Juazeiro",
        &["Feira de Santana", "Lençóis", "Salvador", "Juazeiro"],
    ),
    (
        "Lençóis",
        "Salvador",
        &["Lençóis", "Juazeiro", "Salvador"],
    ),
    (
        "Lençóis",
        "Feira de Santana",
        &["Lençóis", "Salvador", "Feira de Santana"],
    ),
    (
        "Lençóis",
        "Ilhéus",
        &["Lençóis", "Feira de Santana", "Juazeiro", "Ilhéus"],
    ),
    (
        "Lençóis",
        "Juazeiro",
        &["Lençóis", "Ilhéus", "Salvador", "Juazeiro"],
    ),
    (
        "Juazeiro",
        "Salvador",
        &["Juazeiro", "Lençóis", "Salvador"],
    ),
    (
        "Juazeiro",
        "Feira de Santana",
        &["Juazeiro", "Ilhéus", "Feira de Santana"],
    ),
    (
        "Juazeiro",
        "Lençóis",
        &["Juazeiro", "Salvador", "Lençóis"],
    ),
    (
        "Juazeiro",
        "Ilhéus",
        &["Juazeiro", "Feira de Santana", "Ilhéus"],
    ),
    (
        "Ilhéus",
        "Salvador",
        &["Ilhéus", "Feira de Santana", "Lençóis", "Salvador"],
    ),
    (
        "Ilhéus",
        "Feira de Santana",
        &["Ilhéus", "Juazeiro", "Feira de Santana"],
    ),
    (
        "Ilhéus",
        "Lençóis",
        &["Ilhéus", "Salvador", "Lençóis"],
    ),
    (
        "Ilhéus",
        "Juazeiro",
        &["Ilhéus", "Lençóis", "Juazeiro"],
    ),
];

/// Candidate routes for a trip, each as a list of charging segments with
/// concrete windows. Empty when origin or destination is unknown; that is a
/// valid "no path" answer.
pub fn generate_routes(
    origin: &str,
    destination: &str,
    departure: DateTime<Utc>,
    config: &PlannerConfig,
) -> Vec<Vec<Segment>> {
    if origin == destination {
        return Vec::new();
    }
    if !CITIES.contains(&origin) || !CITIES.contains(&destination) {
        return Vec::new();
    }

    let mut routes = Vec::new();

    if let Some((_, _, cities)) = ROUTE_TABLE
        .iter()
        .find(|(from, to, _)| *from == origin && *to == destination)
    {
        routes.push(schedule(cities, departure, config));
    }

    // The direct two-stop trip is always offered as an alternative.
    let direct = [origin, destination];
    if routes.iter().all(|r| r.len() != direct.len()) {
        routes.push(schedule(&direct, departure, config));
    }

    routes
}

/// Assign a window to every city of the sequence.
fn schedule(cities: &[&str], departure: DateTime<Utc>, config: &PlannerConfig) -> Vec<Segment> {
    let charge = to_delta(config.charging_duration);
    let travel = to_delta(config.travel_time);

    let mut start = departure + to_delta(config.preparation_buffer);
    let mut segments = Vec::with_capacity(cities.len());

    for city in cities {
        segments.push(Segment {
            city: city.to_string(),
            reservation_window: Window::new(start, start + charge),
        });
        start = start + charge + travel;
    }

    segments
}

fn to_delta(duration: std::time::Duration) -> TimeDelta {
    TimeDelta::seconds(duration.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn departure() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 2, 9, 0, 0).unwrap()
    }

    #[test]
    fn known_pair_yields_routes_from_origin_to_destination() {
        let routes = generate_routes("Salvador", "Ilhéus", departure(), &PlannerConfig::default());
        assert!(!routes.is_empty());

        for route in &routes {
            assert_eq!(route.first().map(|s| s.city.as_str()), Some("Salvador"));
            assert_eq!(route.last().map(|s| s.city.as_str()), Some("Ilhéus"));
        }
        // Table route plus the direct alternative.
        assert_eq!(routes.len(), 2);
    }

    #[test]
    fn every_city_pair_is_covered() {
        for origin in CITIES {
            for destination in CITIES {
                if origin == destination {
                    continue;
                }
                let routes =
                    generate_routes(origin, destination, departure(), &PlannerConfig::default());
                assert!(
                    !routes.is_empty(),
                    "no route for {origin} -> {destination}"
                );
            }
        }
    }

    #[test]
    fn windows_are_valid_ordered_and_disjoint() {
        let routes = generate_routes(
            "Feira de Santana",
            "Juazeiro",
            departure(),
            &PlannerConfig::default(),
        );

        for route in &routes {
            for segment in route {
                assert!(segment.reservation_window.is_valid());
            }
            for pair in route.windows(2) {
                let earlier = &pair[0].reservation_window;
                let later = &pair[1].reservation_window;
                assert!(earlier.end_time_utc <= later.start_time_utc);
                assert!(!earlier.overlaps(later));
            }
        }
    }

    #[test]
    fn unknown_cities_and_trivial_trips_yield_no_path() {
        let config = PlannerConfig::default();
        assert!(generate_routes("Atlantis", "Salvador", departure(), &config).is_empty());
        assert!(generate_routes("Salvador", "Atlantis", departure(), &config).is_empty());
        assert!(generate_routes("Salvador", "Salvador", departure(), &config).is_empty());
    }
}
