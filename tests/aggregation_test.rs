//! Aggregation over a live ingest/reconcile pipeline.

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use schoolride::aggregate::{AggregationEngine, TimeWindow};
use schoolride::groups::Group;
use schoolride::registry::{Cyclist, Device};
use schoolride::reconcile::ReconcileWorker;
use schoolride::sessions::IngestService;
use schoolride::storage::{self, Database, SharedDatabase};

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 10, h, m, 0).unwrap()
}

struct Fixture {
    db: SharedDatabase,
    school: Uuid,
    class_a: Uuid,
    class_b: Uuid,
}

/// One school with two classes, one cyclist and device per class.
fn setup() -> Fixture {
    let db = Database::open_in_memory().expect("Failed to create database");

    let school = Group::new("School", "SCH");
    let class_a = Group::new_child("5a", "5a", school.id);
    let class_b = Group::new_child("5b", "5b", school.id);
    db.insert_group(&school).unwrap();
    db.insert_group(&class_a).unwrap();
    db.insert_group(&class_b).unwrap();

    for (tag, name, hw, class) in [
        ("TAG-A", "Alex", "HW-A", class_a.id),
        ("TAG-B", "Billie", "HW-B", class_b.id),
    ] {
        let cyclist = Cyclist::new(tag, name);
        db.insert_cyclist(&cyclist).unwrap();
        db.add_cyclist_to_group(cyclist.id, class).unwrap();
        let device = Device::new(hw, name);
        db.insert_device(&device).unwrap();
    }

    Fixture {
        db: storage::shared(db),
        school: school.id,
        class_a: class_a.id,
        class_b: class_b.id,
    }
}

#[test]
fn reconciled_metrics_roll_up_to_school() {
    let f = setup();
    let ingest = IngestService::new(f.db.clone());
    let worker = ReconcileWorker::new(f.db.clone());
    let engine = AggregationEngine::new(f.db.clone());

    ingest.ingest("TAG-A", "HW-A", 3.0, Some(at(9, 10))).unwrap();
    ingest.ingest("TAG-B", "HW-B", 2.0, Some(at(9, 20))).unwrap();
    worker.reconcile_active_sessions(at(9, 30)).unwrap();

    let candidates = [f.school, f.class_a, f.class_b];
    let result = engine.aggregate(&candidates, at(9, 30)).unwrap();

    let school = result.figures.get(&f.school).unwrap();
    assert_eq!(school.get(TimeWindow::Daily), 5.0);
    assert_eq!(school.get(TimeWindow::Total), 5.0);

    assert_eq!(
        result.figures.get(&f.class_a).unwrap().get(TimeWindow::Daily),
        3.0
    );
    assert_eq!(
        result.figures.get(&f.class_b).unwrap().get(TimeWindow::Daily),
        2.0
    );

    // Only the top-level school counts toward the grand total.
    assert_eq!(result.grand_total.get(TimeWindow::Daily), 5.0);

    // The school's rolled-up 5.0 beats both classes.
    let holder = result.record_holders.get(&TimeWindow::Daily).unwrap();
    assert_eq!(holder.group_id, f.school);
    assert_eq!(holder.value_km, 5.0);
}

#[test]
fn yesterday_rides_leave_daily_window_empty() {
    let f = setup();
    let ingest = IngestService::new(f.db.clone());
    let worker = ReconcileWorker::new(f.db.clone());
    let engine = AggregationEngine::new(f.db.clone());

    let yesterday = at(9, 10) - Duration::days(1);
    ingest.ingest("TAG-A", "HW-A", 4.0, Some(yesterday)).unwrap();
    worker.reconcile_active_sessions(yesterday).unwrap();

    let result = engine.aggregate(&[f.school], at(9, 30)).unwrap();
    let school = result.figures.get(&f.school).unwrap();

    assert_eq!(school.get(TimeWindow::Daily), 0.0);
    assert_eq!(school.get(TimeWindow::Weekly), 4.0);
    assert_eq!(school.get(TimeWindow::Total), 4.0);
}

#[test]
fn group_running_totals_match_total_window() {
    let f = setup();
    let ingest = IngestService::new(f.db.clone());
    let worker = ReconcileWorker::new(f.db.clone());
    let engine = AggregationEngine::new(f.db.clone());

    ingest.ingest("TAG-A", "HW-A", 1.5, Some(at(9, 10))).unwrap();
    ingest.ingest("TAG-A", "HW-A", 0.5, Some(at(9, 40))).unwrap();
    worker.reconcile_active_sessions(at(9, 45)).unwrap();

    // Running total written at ingest time agrees with the historical sum.
    let stored = {
        let guard = storage::lock(&f.db).unwrap();
        guard.get_group(f.school).unwrap().unwrap().distance_total_km
    };
    let result = engine.aggregate(&[f.school], at(9, 45)).unwrap();
    assert_eq!(stored, 2.0);
    assert_eq!(
        result.figures.get(&f.school).unwrap().get(TimeWindow::Total),
        stored
    );
}
