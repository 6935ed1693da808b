// Riptide: Compiling Network Policies into Flow-Table Updates
// Copyright (C) 2021  Tibor Schneider
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Test the query buckets

use crate::buckets::*;
use crate::classifier::{Action, Classifier, Match, Sink, Trace};
use crate::packet::{HeaderValue, Packet, DSTPORT, HEADER_LEN, PAYLOAD_LEN, SRCIP, SWITCH};
use lazy_static::lazy_static;
use maplit::{btreemap, btreeset};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

lazy_static! {
    static ref H1: HeaderValue = HeaderValue::ip("10.0.0.1").unwrap();
    static ref H2: HeaderValue = HeaderValue::ip("10.0.0.2").unwrap();
}

fn key(switch: u32, priority: u16, version: u16) -> RuleKey {
    RuleKey { matches: Match::identity().with(SWITCH, switch).with(DSTPORT, 80u32), priority, version }
}

fn from(src: &HeaderValue, len: u32) -> Packet {
    Packet::new().modify(SRCIP, src.clone()).with(HEADER_LEN, 20u32).with(PAYLOAD_LEN, len)
}

fn collect<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static) {
    let store: Arc<Mutex<Vec<T>>> = Arc::new(Mutex::new(Vec::new()));
    let shared = store.clone();
    (store, move |x: &T| shared.lock().unwrap().push(x.clone()))
}

#[test]
fn test_count_bucket_without_rules() {
    let b = CountBucket::new();
    let (results, cb) = collect::<(u64, u64)>();
    b.register_callback(cb);
    b.apply_packet(&from(&H1, 80));
    assert_eq!(b.begin_pull(), PullStatus::NoStatsRequested);
    assert_eq!(*results.lock().unwrap(), vec![(1, 100)]);
}

#[test]
fn test_count_bucket_pull() {
    let b = CountBucket::new();
    let (results, cb) = collect::<(u64, u64)>();
    b.register_callback(cb);
    b.add_match(key(1, 60000, 1));
    b.add_match(key(2, 60000, 1));

    assert_eq!(b.begin_pull(), PullStatus::Requested(btreeset! {1, 2}));
    assert!(b.is_outstanding(1));

    // switch 3 was never asked
    b.handle_flow_stats_reply(3, &[(key(3, 60000, 1), 100, 100)]);
    b.handle_flow_stats_reply(1, &[(key(1, 60000, 1), 5, 500)]);
    assert!(results.lock().unwrap().is_empty());
    assert!(!b.is_outstanding(1));

    // unknown rules in a reply are skipped
    b.handle_flow_stats_reply(2, &[(key(2, 60000, 1), 3, 300), (key(2, 59999, 1), 7, 700)]);
    assert_eq!(*results.lock().unwrap(), vec![(8, 800)]);
    assert_eq!(b.rules()[&key(1, 60000, 1)].packets, 5);
}

#[test]
fn test_count_bucket_deleted_rules() {
    let b = CountBucket::new();
    let (results, cb) = collect::<(u64, u64)>();
    b.register_callback(cb);
    b.add_match(key(1, 60000, 1));
    b.add_match(key(2, 60000, 1));

    // flushed by a flow-removed notification
    b.delete_match(&key(1, 60000, 1));
    assert!(b.rules()[&key(1, 60000, 1)].to_delete);
    assert!(b.handle_flow_removed(&key(1, 60000, 1), 6, 600));
    assert!(!b.handle_flow_removed(&key(1, 60000, 1), 6, 600));
    assert_eq!(b.persistent(), (6, 600));

    // flushed by the next stats reply still carrying the rule
    b.delete_match(&key(2, 60000, 1));
    assert_eq!(b.begin_pull(), PullStatus::Requested(btreeset! {2}));
    b.handle_flow_stats_reply(2, &[(key(2, 60000, 1), 4, 400)]);
    assert_eq!(*results.lock().unwrap(), vec![(10, 1000)]);
    assert!(b.rules().is_empty());

    assert_eq!(b.begin_pull(), PullStatus::NoStatsRequested);
    assert_eq!(*results.lock().unwrap(), vec![(10, 1000), (10, 1000)]);
}

#[test]
fn test_count_bucket_carry_over() {
    let b = CountBucket::new();
    b.add_match(key(1, 60000, 1));
    b.delete_match(&key(1, 60000, 1));
    b.carry_over(key(1, 60000, 1));
    let stats = b.rules()[&key(1, 60000, 1)];
    assert!(!stats.existing);
    assert!(!stats.to_delete);

    // a rule installed before the bucket tracked it
    b.carry_over(key(2, 60000, 1));
    assert!(b.rules()[&key(2, 60000, 1)].existing);

    // bulk updates block pulls only while they run
    b.start_update();
    b.finish_update();
    assert_eq!(b.begin_pull(), PullStatus::Requested(btreeset! {1}));
}

#[test]
fn test_count_bucket_baseline() {
    let b = CountBucket::new();
    let (results, cb) = collect::<(u64, u64)>();
    b.register_callback(cb);
    b.add_match(key(1, 60000, 1));
    b.carry_over(key(1, 59999, 1));

    b.begin_pull();
    b.handle_flow_stats_reply(1, &[(key(1, 60000, 1), 2, 200), (key(1, 59999, 1), 40, 4000)]);
    b.begin_pull();
    b.handle_flow_stats_reply(1, &[(key(1, 60000, 1), 3, 300), (key(1, 59999, 1), 45, 4500)]);
    assert_eq!(*results.lock().unwrap(), vec![(2, 200), (8, 800)]);
    assert_eq!(b.rules()[&key(1, 59999, 1)].baseline, (40, 4000));

    // the final counters of the rule also start at the baseline
    b.delete_match(&key(1, 59999, 1));
    assert!(b.handle_flow_removed(&key(1, 59999, 1), 46, 4600));
    assert_eq!(b.persistent(), (6, 600));
}

#[test]
fn test_count_bucket_replaced_rules() {
    let b = CountBucket::new();
    let (results, cb) = collect::<(u64, u64)>();
    b.register_callback(cb);
    b.add_match(key(1, 60000, 1));
    b.begin_pull();
    b.handle_flow_stats_reply(1, &[(key(1, 60000, 1), 5, 500)]);

    // modified twice before the switch reports again
    b.replace_match(&key(1, 60000, 1), key(1, 60000, 2));
    b.replace_match(&key(1, 60000, 2), key(1, 60000, 3));
    assert_eq!(b.rules().len(), 3);
    assert!(b.rules().values().all(|s| !s.to_delete));
    assert!(b.tracks(&key(1, 60000, 1)));

    // the switch kept counting under the latest version
    assert_eq!(b.begin_pull(), PullStatus::Requested(btreeset! {1}));
    b.handle_flow_stats_reply(1, &[(key(1, 60000, 3), 9, 900)]);
    assert_eq!(*results.lock().unwrap(), vec![(5, 500), (9, 900)]);
    assert_eq!(b.rules().keys().collect::<Vec<_>>(), vec![&key(1, 60000, 3)]);
    assert_eq!(b.persistent(), (0, 0));

    // a replaced rule that is removed before reporting takes its predecessor along
    b.replace_match(&key(1, 60000, 3), key(1, 60000, 4));
    b.delete_match(&key(1, 60000, 4));
    assert!(b.handle_flow_removed(&key(1, 60000, 4), 12, 1200));
    assert!(b.rules().is_empty());
    assert_eq!(b.persistent(), (12, 1200));

    // a bucket new to the rule only counts from now on
    b.replace_match(&key(2, 60000, 1), key(2, 60000, 2));
    assert!(!b.tracks(&key(2, 60000, 1)));
    assert!(b.rules()[&key(2, 60000, 2)].existing);
}

#[test]
fn test_count_bucket_retired_rules() {
    let b = CountBucket::new();
    b.add_match(key(1, 60000, 1));
    b.add_match(key(2, 60000, 1));
    b.begin_pull();
    b.handle_flow_stats_reply(1, &[(key(1, 60000, 1), 5, 500)]);
    b.handle_flow_stats_reply(2, &[(key(2, 60000, 1), 1, 100)]);

    b.retire_match(&key(1, 60000, 1));
    assert!(!b.tracks(&key(1, 60000, 1)));
    assert_eq!(b.persistent(), (5, 500));
    assert_eq!(b.begin_pull(), PullStatus::Requested(btreeset! {2}));

    // later counters of the rule are not ours
    b.handle_flow_stats_reply(2, &[(key(1, 60000, 1), 50, 5000), (key(2, 60000, 1), 1, 100)]);
    assert_eq!(b.persistent(), (5, 500));
}

#[test]
fn test_bucket_identity() {
    let a = CountBucket::new();
    let b = CountBucket::new();
    assert_eq!(BucketRef::from(a.clone()), BucketRef::from(a.clone()));
    assert_ne!(BucketRef::from(a.clone()), BucketRef::from(b));
    assert!(!BucketRef::from(a).needs_controller());
    assert!(BucketRef::from(FwdBucket::new()).needs_controller());
}

#[test]
fn test_fwd_bucket_callbacks_isolated() {
    let b = FwdBucket::new();
    let (results, cb) = collect::<Packet>();
    b.register_callback(|_| panic!("broken callback"));
    b.register_callback(cb);
    b.deliver(&from(&H1, 10));
    b.deliver(&from(&H2, 10));
    assert_eq!(*results.lock().unwrap(), vec![from(&H1, 10), from(&H2, 10)]);
}

#[test]
fn test_packets_limit() {
    let q = packets(Some(1), vec![SRCIP.to_string()]);
    let (results, cb) = collect::<Packet>();
    q.register_callback(cb);
    q.bucket().deliver(&from(&H1, 10));
    q.bucket().deliver(&from(&H1, 20));
    q.bucket().deliver(&from(&H2, 30));
    assert_eq!(*results.lock().unwrap(), vec![from(&H1, 10), from(&H2, 30)]);

    // grouping on all headers
    let q = packets(Some(1), vec![]);
    let (results, cb) = collect::<Packet>();
    q.register_callback(cb);
    q.bucket().deliver(&from(&H1, 10));
    q.bucket().deliver(&from(&H1, 10));
    q.bucket().deliver(&from(&H1, 20));
    assert_eq!(results.lock().unwrap().len(), 2);

    // without limit, every packet is delivered and the policy never changes
    let q = packets(None, vec![]);
    let (results, cb) = collect::<Packet>();
    q.register_callback(cb);
    for _ in 0..5 {
        q.bucket().deliver(&from(&H1, 10));
    }
    assert_eq!(results.lock().unwrap().len(), 5);
    assert!(q.excluded().is_empty());
}

fn to_controller(c: &Classifier, pkt: &Packet) -> bool {
    c.winner(pkt).map(|r| r.actions.contains(&Action::Controller)).unwrap_or(false)
}

#[test]
fn test_packets_limit_narrows_policy() {
    let q = packets(Some(2), vec![SRCIP.to_string()]);
    let (tx, rx) = mpsc::channel();
    q.cell().subscribe(tx);

    let c = q.policy().compile().unwrap();
    assert!(to_controller(&c, &from(&H1, 10)));
    assert!(to_controller(&c, &from(&H2, 10)));

    q.bucket().deliver(&from(&H1, 10));
    assert!(q.excluded().is_empty());
    assert!(rx.try_recv().is_err());

    // the second packet exhausts the group
    q.bucket().deliver(&from(&H1, 20));
    assert_eq!(q.excluded(), vec![Match::identity().with(SRCIP, H1.clone())]);
    assert_eq!(rx.try_recv(), Ok(q.cell().id()));

    let c = q.policy().compile().unwrap();
    assert!(!to_controller(&c, &from(&H1, 10)));
    assert!(to_controller(&c, &from(&H2, 10)));

    let mut trace = Trace::new();
    assert!(q.policy().eval_traced(&from(&H1, 30), &mut trace).is_empty());
    assert!(trace.is_empty());
    q.policy().eval_traced(&from(&H2, 30), &mut trace);
    assert_eq!(trace, vec![(Sink::Bucket(BucketRef::from(q.bucket())), from(&H2, 30))]);

    // late packets of the exhausted group do not exclude it twice
    q.bucket().deliver(&from(&H1, 40));
    assert_eq!(q.excluded().len(), 1);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_aggregate_periodic_report() {
    let q = Arc::new(count_packets(vec![]));
    let (reports, cb) = collect::<Aggregate>();
    q.register_callback(cb);
    q.bucket().deliver(&from(&H1, 10));
    let handle = q.start_reporting(Duration::from_millis(5));
    thread::sleep(Duration::from_millis(50));
    q.stop_reporting();
    handle.join().unwrap();
    let reports = reports.lock().unwrap();
    assert!(reports.len() >= 2);
    assert!(reports.iter().all(|r| *r == Aggregate::Total(1)));
}

#[test]
fn test_count_queries() {
    let q = count_packets(vec![]);
    for len in [10, 20, 30].iter() {
        q.bucket().deliver(&from(&H1, *len));
    }
    assert_eq!(q.value(), Aggregate::Total(3));

    let q = count_bytes(vec![SRCIP.to_string()]);
    let (reports, cb) = collect::<Aggregate>();
    q.register_callback(cb);
    q.bucket().deliver(&from(&H1, 10));
    q.bucket().deliver(&from(&H1, 20));
    q.bucket().deliver(&from(&H2, 80));
    let expected = Aggregate::Grouped(btreemap! {
        vec![(SRCIP.to_string(), H1.clone())] => 70,
        vec![(SRCIP.to_string(), H2.clone())] => 100,
    });
    assert_eq!(q.value(), expected);
    q.report();
    assert_eq!(*reports.lock().unwrap(), vec![expected]);
}

const RECORD: &str = "2021-03-01 10:00:00.000 1.500 \
    1 6 10.0.0.1 10.0.0.2 1234 80 0 00:00:00:00:00:01 00:00:00:00:00:02 3 10 1000.0 5333 100 1";

#[test]
fn test_parse_record() {
    let pkt = parse_record(RECORD).unwrap();
    assert_eq!(pkt.get_int(SWITCH), Some(1));
    assert_eq!(pkt.get(SRCIP), Some(&*H1));
    assert_eq!(pkt.get_int(DSTPORT), Some(80));
    assert_eq!(pkt.get_int("bytes"), Some(1000));
    assert_eq!(pkt.get("srcmac"), Some(&HeaderValue::mac("00:00:00:00:00:01").unwrap()));

    assert!(parse_record("2021-03-01 10:00:00.000 1.500 1 6").is_err());
    let icmp = RECORD.replacen(" 6 ", " ICMP ", 1);
    assert_eq!(parse_record(&icmp).unwrap().get_int("protocol"), Some(2048));
}

#[derive(Default)]
struct FakeSpawner {
    spawned: Arc<AtomicUsize>,
    alive: Arc<AtomicBool>,
}

struct FakeHandle(Arc<AtomicBool>);

impl CollectorHandle for FakeHandle {
    fn is_running(&mut self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn terminate(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CollectorSpawner for FakeSpawner {
    fn spawn(&self, _capture: CaptureType, _dir: &Path) -> Result<Box<dyn CollectorHandle>, BucketError> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.alive.store(true, Ordering::SeqCst);
        Ok(Box::new(FakeHandle(self.alive.clone())))
    }
}

struct FailingSpawner;

impl CollectorSpawner for FailingSpawner {
    fn spawn(&self, capture: CaptureType, _dir: &Path) -> Result<Box<dyn CollectorHandle>, BucketError> {
        Err(BucketError::CollectorSpawn(capture.daemon().to_string(), "not installed".to_string()))
    }
}

fn dump_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("riptide-{}-{}", name, std::process::id()))
}

#[test]
fn test_collector_hub() {
    let spawner = FakeSpawner::default();
    let spawned = spawner.spawned.clone();
    let alive = spawner.alive.clone();
    let dump = dump_path("flows");
    std::fs::write(&dump, format!("{}\n\n{}\n", RECORD, RECORD)).unwrap();
    let hub = CollectorHub::new(spawner, std::env::temp_dir(), dump.clone());

    let b1 = NetflowBucket::new(CaptureType::Netflow, &hub).unwrap();
    let b2 = NetflowBucket::new(CaptureType::Netflow, &hub).unwrap();
    // the collector is shared
    assert_eq!(spawned.load(Ordering::SeqCst), 1);
    assert_eq!(hub.running(), vec![CaptureType::Netflow].into_iter().collect::<HashSet<_>>());

    let (results, cb) = collect::<Vec<Packet>>();
    b1.register_callback(cb);
    b2.add_match(Match::identity().with(SWITCH, 1u32));
    assert_eq!(b2.matches().len(), 1);
    drop(b2);
    assert_eq!(hub.live_buckets(), 1);

    assert_eq!(hub.deliver_dump(), Ok(2));
    assert_eq!(results.lock().unwrap().len(), 1);
    assert_eq!(results.lock().unwrap()[0].len(), 2);

    // the dump is only delivered again once it changed
    assert_eq!(hub.poll_dump(), Ok(true));
    assert_eq!(hub.poll_dump(), Ok(false));

    hub.shutdown();
    assert!(!alive.load(Ordering::SeqCst));
    std::fs::remove_file(&dump).unwrap();
    assert!(matches!(hub.deliver_dump(), Err(BucketError::DumpUnreadable(_))));
}

#[test]
fn test_collector_spawn_failure() {
    let hub = CollectorHub::new(FailingSpawner, std::env::temp_dir(), dump_path("missing"));
    assert!(matches!(
        NetflowBucket::new(CaptureType::Sflow, &hub),
        Err(BucketError::CollectorSpawn(_, _))
    ));
    assert_eq!(hub.live_buckets(), 0);
}
