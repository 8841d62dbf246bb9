//! Filtering and statistics over a vehicle set.
//!
//! Dates are compared in the local timezone, the way an attendant reads them.

use chrono::{Duration, Local, NaiveDate};

use crate::vehicle::{Vehicle, VehicleStatus};

/// Which visits a report covers, by entry date or status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportRange {
  Today,
  /// Both days inclusive
  Period {
    from: NaiveDate,
    to: NaiveDate,
  },
  All,
  Inside,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportFilter {
  pub range: ReportRange,
  pub status: Option<VehicleStatus>,
  pub model: Option<String>,
  pub owner: Option<String>,
  pub tag: Option<String>,
  pub plate: Option<String>,
}

impl ReportFilter {
  pub fn new(range: ReportRange) -> Self {
    Self {
      range,
      status: None,
      model: None,
      owner: None,
      tag: None,
      plate: None,
    }
  }

  pub fn matches(&self, vehicle: &Vehicle, today: NaiveDate) -> bool {
    let in_range = match self.range {
      ReportRange::Today => entry_date(vehicle) == today,
      ReportRange::Period { from, to } => (from..=to).contains(&entry_date(vehicle)),
      ReportRange::All => true,
      ReportRange::Inside => vehicle.is_inside(),
    };

    in_range
      && self.status.map_or(true, |s| vehicle.status == s)
      && field_matches(&vehicle.model, &self.model)
      && field_matches(&vehicle.owner, &self.owner)
      && field_matches(&vehicle.tag, &self.tag)
      && field_matches(&vehicle.plate, &self.plate)
  }

  pub fn apply<'a>(&self, vehicles: &'a [Vehicle], today: NaiveDate) -> Vec<&'a Vehicle> {
    vehicles
      .iter()
      .filter(|v| self.matches(v, today))
      .collect()
  }
}

fn entry_date(vehicle: &Vehicle) -> NaiveDate {
  vehicle.entered_at.with_timezone(&Local).date_naive()
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
  haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn field_matches(value: &str, wanted: &Option<String>) -> bool {
  match wanted.as_deref().map(str::trim) {
    None | Some("") => true,
    Some(needle) => contains_ignore_case(value, needle),
  }
}

/// Quick search over tag, plate, model and owner. A blank term matches all.
pub fn search<'a>(vehicles: &'a [Vehicle], term: &str) -> Vec<&'a Vehicle> {
  let term = term.trim();
  vehicles
    .iter()
    .filter(|v| {
      term.is_empty()
        || contains_ignore_case(&v.tag, term)
        || contains_ignore_case(&v.plate, term)
        || contains_ignore_case(&v.model, term)
        || contains_ignore_case(&v.owner, term)
    })
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
  pub total: usize,
  pub inside: usize,
  pub exited: usize,
  pub entered_today: usize,
  /// Mean stay over finished visits
  pub average_stay: Option<Duration>,
}

impl Summary {
  pub fn from_vehicles<'a>(
    vehicles: impl IntoIterator<Item = &'a Vehicle>,
    today: NaiveDate,
  ) -> Self {
    let mut summary = Summary {
      total: 0,
      inside: 0,
      exited: 0,
      entered_today: 0,
      average_stay: None,
    };
    let mut stay_total = Duration::zero();
    let mut finished: i32 = 0;

    for vehicle in vehicles {
      summary.total += 1;
      match vehicle.status {
        VehicleStatus::Inside => summary.inside += 1,
        VehicleStatus::Exited => summary.exited += 1,
      }
      if entry_date(vehicle) == today {
        summary.entered_today += 1;
      }
      if let Some(stay) = stay_duration(vehicle) {
        stay_total = stay_total + stay;
        finished += 1;
      }
    }

    if finished > 0 {
      summary.average_stay = Some(stay_total / finished);
    }
    summary
  }
}

/// Length of a finished visit.
pub fn stay_duration(vehicle: &Vehicle) -> Option<Duration> {
  vehicle
    .exited_at
    .map(|exited| (exited - vehicle.entered_at).max(Duration::zero()))
}

pub fn format_duration(duration: Duration) -> String {
  format!(
    "{}h {}min",
    duration.num_hours(),
    duration.num_minutes() % 60
  )
}

pub fn format_stay(vehicle: &Vehicle) -> String {
  stay_duration(vehicle).map_or_else(|| "in progress".to_string(), format_duration)
}

/// Lowest positive number not taken by a numeric tag, zero-padded to two
/// digits.
pub fn next_tag_number(vehicles: &[Vehicle]) -> String {
  let mut taken: Vec<u64> = vehicles
    .iter()
    .map(|v| v.tag.trim())
    .filter(|tag| !tag.is_empty() && tag.chars().all(|c| c.is_ascii_digit()))
    .filter_map(|tag| tag.parse().ok())
    .collect();
  taken.sort_unstable();
  taken.dedup();

  let mut next = 1;
  for tag in taken {
    if tag == next {
      next += 1;
    } else if tag > next {
      break;
    }
  }
  format!("{:02}", next)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::vehicle::{NewVehicle, VehiclePatch};
  use chrono::{DateTime, TimeZone, Utc};

  fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Local
      .with_ymd_and_hms(y, m, d, h, min, 0)
      .unwrap()
      .with_timezone(&Utc)
  }

  fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
  }

  fn visit(plate: &str, entered: DateTime<Utc>) -> Vehicle {
    NewVehicle {
      entered_at: Some(entered),
      ..NewVehicle::new(plate)
    }
    .into_vehicle(Some(plate.to_lowercase()))
  }

  fn exited(mut vehicle: Vehicle, at: DateTime<Utc>) -> Vehicle {
    vehicle.apply(&VehiclePatch::exit(at)).unwrap();
    vehicle
  }

  #[test]
  fn test_ranges() {
    let today = day(2024, 5, 10);
    let vehicles = vec![
      visit("AAA-1111", at(2024, 5, 10, 9, 0)),
      exited(visit("BBB-2222", at(2024, 5, 8, 12, 0)), at(2024, 5, 8, 14, 0)),
      visit("CCC-3333", at(2024, 5, 1, 12, 0)),
    ];

    let plates = |filter: ReportFilter| -> Vec<String> {
      filter
        .apply(&vehicles, today)
        .into_iter()
        .map(|v| v.plate.clone())
        .collect()
    };

    assert_eq!(plates(ReportFilter::new(ReportRange::Today)), vec!["AAA-1111"]);
    assert_eq!(
      plates(ReportFilter::new(ReportRange::Period {
        from: day(2024, 5, 1),
        to: day(2024, 5, 8),
      })),
      vec!["BBB-2222", "CCC-3333"]
    );
    assert_eq!(plates(ReportFilter::new(ReportRange::All)).len(), 3);
    assert_eq!(
      plates(ReportFilter::new(ReportRange::Inside)),
      vec!["AAA-1111", "CCC-3333"]
    );
  }

  #[test]
  fn test_field_filters_ignore_case() {
    let mut vehicle = visit("ABC-1234", at(2024, 5, 10, 9, 0));
    vehicle.model = "Onix".to_string();
    vehicle.owner = "Maria Souza".to_string();
    vehicle.tag = "07".to_string();
    let today = day(2024, 5, 10);

    let mut filter = ReportFilter::new(ReportRange::All);
    filter.model = Some("ONI".to_string());
    filter.owner = Some("souza".to_string());
    filter.plate = Some("abc".to_string());
    filter.tag = Some("".to_string());
    assert!(filter.matches(&vehicle, today));

    filter.status = Some(VehicleStatus::Exited);
    assert!(!filter.matches(&vehicle, today));
  }

  #[test]
  fn test_search() {
    let mut a = visit("ABC-1234", at(2024, 5, 10, 9, 0));
    a.tag = "12".to_string();
    let mut b = visit("XYZ-9876", at(2024, 5, 10, 9, 30));
    b.owner = "Carlos".to_string();
    let vehicles = vec![a, b];

    assert_eq!(search(&vehicles, "abc").len(), 1);
    assert_eq!(search(&vehicles, "12")[0].plate, "ABC-1234");
    assert_eq!(search(&vehicles, "carl")[0].plate, "XYZ-9876");
    assert_eq!(search(&vehicles, "  ").len(), 2);
    assert!(search(&vehicles, "nothing").is_empty());
  }

  #[test]
  fn test_summary() {
    let today = day(2024, 5, 10);
    let vehicles = vec![
      visit("AAA-1111", at(2024, 5, 10, 9, 0)),
      exited(visit("BBB-2222", at(2024, 5, 10, 8, 0)), at(2024, 5, 10, 10, 0)),
      exited(visit("CCC-3333", at(2024, 5, 9, 8, 0)), at(2024, 5, 9, 9, 0)),
    ];

    let summary = Summary::from_vehicles(&vehicles, today);

    assert_eq!(summary.total, 3);
    assert_eq!(summary.inside, 1);
    assert_eq!(summary.exited, 2);
    assert_eq!(summary.entered_today, 2);
    assert_eq!(summary.average_stay, Some(Duration::minutes(90)));
  }

  #[test]
  fn test_summary_without_finished_visits() {
    let summary = Summary::from_vehicles(&[], day(2024, 5, 10));
    assert_eq!(summary.total, 0);
    assert!(summary.average_stay.is_none());
  }

  #[test]
  fn test_format_stay() {
    let open = visit("AAA-1111", at(2024, 5, 10, 9, 0));
    assert_eq!(format_stay(&open), "in progress");

    let done = exited(open, at(2024, 5, 10, 11, 25));
    assert_eq!(format_stay(&done), "2h 25min");
    assert_eq!(format_duration(Duration::minutes(59)), "0h 59min");
  }

  #[test]
  fn test_next_tag_number() {
    let tagged = |tags: &[&str]| -> Vec<Vehicle> {
      tags
        .iter()
        .map(|t| {
          let mut v = visit("AAA-1111", Utc::now());
          v.tag = t.to_string();
          v
        })
        .collect()
    };

    assert_eq!(next_tag_number(&[]), "01");
    assert_eq!(next_tag_number(&tagged(&["01", "02", "04"])), "03");
    assert_eq!(next_tag_number(&tagged(&["1", "2", "2", "3"])), "04");
    assert_eq!(next_tag_number(&tagged(&["A1", "", "2"])), "01");
    assert_eq!(next_tag_number(&tagged(&["05"])), "01");
    let many: Vec<String> = (1..=120).map(|n| n.to_string()).collect();
    let refs: Vec<&str> = many.iter().map(String::as_str).collect();
    assert_eq!(next_tag_number(&tagged(&refs)), "121");
  }
}
