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

//! # Netflow Bucket
//!
//! Netflow and sFlow records are collected out of band by an external collector daemon (`nfcapd`
//! or `sfcapd`), which periodically writes a text dump of the records. A [`CollectorHub`] starts
//! one collector per capture type on demand, watches the dump file, and delivers every new dump
//! to all live [`NetflowBucket`]s.

use super::{dispatch, BucketError, Callback};
use crate::classifier::Match;
use crate::lock;
use crate::packet::{HeaderValue, MacAddr, Packet, RAW};

use log::*;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, SystemTime};

/// Seconds between two dumps of the collector
pub const COLLECTOR_INTERVAL: u64 = 10;

/// Columns of a record, after the three leading date and duration columns
const RECORD_COLUMNS: [&str; 15] = [
    "switch", "protocol", "srcip", "dstip", "srcport", "dstport", "vlan_id", "srcmac", "dstmac",
    "port", "packets", "bytes", "bps", "Bpp", "flows",
];

/// Kind of flow records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureType {
    /// Netflow, collected by `nfcapd`
    Netflow,
    /// sFlow, collected by `sfcapd`
    Sflow,
}

impl CaptureType {
    /// Name of the collector daemon
    pub fn daemon(&self) -> &'static str {
        match self {
            Self::Netflow => "nfcapd",
            Self::Sflow => "sfcapd",
        }
    }

    /// UDP port the collector listens on
    pub fn port(&self) -> u16 {
        match self {
            Self::Netflow => 12345,
            Self::Sflow => 12346,
        }
    }
}

/// Handle to a running collector
pub trait CollectorHandle: Send {
    /// Returns `true` if the collector is still running
    fn is_running(&mut self) -> bool;
    /// Stop the collector
    fn terminate(&mut self);
}

/// Starts collectors
pub trait CollectorSpawner: Send + Sync {
    /// Start a collector writing its dumps into `dir`.
    fn spawn(&self, capture: CaptureType, dir: &Path) -> Result<Box<dyn CollectorHandle>, BucketError>;
}

/// Starts the collector daemons as child processes
#[derive(Debug, Default)]
pub struct ProcessSpawner;

struct ChildHandle(Child);

impl CollectorHandle for ChildHandle {
    fn is_running(&mut self) -> bool {
        matches!(self.0.try_wait(), Ok(None))
    }

    fn terminate(&mut self) {
        if let Err(e) = self.0.kill() {
            warn!("Cannot stop collector: {}", e);
        }
        let _ = self.0.wait();
    }
}

impl CollectorSpawner for ProcessSpawner {
    fn spawn(&self, capture: CaptureType, dir: &Path) -> Result<Box<dyn CollectorHandle>, BucketError> {
        let child = Command::new(capture.daemon())
            .arg("-T")
            .arg("all")
            .arg("-p")
            .arg(capture.port().to_string())
            .arg("-l")
            .arg(dir)
            .arg("-t")
            .arg(COLLECTOR_INTERVAL.to_string())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| BucketError::CollectorSpawn(capture.daemon().to_string(), e.to_string()))?;
        info!("Started {} collector", capture.daemon());
        Ok(Box::new(ChildHandle(child)))
    }
}

/// Parse a single line of the collector dump into a packet.
pub fn parse_record(line: &str) -> Result<Packet, BucketError> {
    let invalid = || BucketError::InvalidRecord(line.to_string());
    let parts: Vec<&str> = line.split_whitespace().skip(3).collect();
    if parts.len() < RECORD_COLUMNS.len() {
        return Err(invalid());
    }
    let mut pkt = Packet::new().with(RAW, HeaderValue::Raw(Vec::new()));
    for (h, v) in RECORD_COLUMNS.iter().zip(parts.iter()) {
        let value = match *h {
            "srcmac" | "dstmac" => HeaderValue::Mac(v.parse::<MacAddr>().map_err(|_| invalid())?),
            "srcip" | "dstip" => HeaderValue::ip(v).map_err(|_| invalid())?,
            "protocol" if *v == "ICMP" => HeaderValue::Int(2048),
            "protocol" => match v.parse::<u32>() {
                Ok(x) => HeaderValue::Int(x),
                Err(_) => HeaderValue::Raw(v.as_bytes().to_vec()),
            },
            "switch" | "packets" | "bytes" | "flows" | "port" | "vlan_id" | "srcport"
            | "dstport" | "bps" | "Bpp" => {
                HeaderValue::Int(v.parse::<f64>().map_err(|_| invalid())? as u32)
            }
            _ => HeaderValue::Raw(v.as_bytes().to_vec()),
        };
        pkt = pkt.with(h, value);
    }
    Ok(pkt)
}

/// # Collector Hub
/// Manages the collector daemons and the dump watcher, shared by all netflow buckets.
pub struct CollectorHub {
    spawner: Box<dyn CollectorSpawner>,
    dump_dir: PathBuf,
    dump_file: PathBuf,
    collectors: Mutex<HashMap<CaptureType, Box<dyn CollectorHandle>>>,
    buckets: Mutex<Vec<Weak<NetflowBucket>>>,
    last_dump: Mutex<Option<SystemTime>>,
    stop: AtomicBool,
}

impl CollectorHub {
    /// Create a new hub. Collectors write into `dump_dir`, and the processed records are read
    /// from `dump_file`.
    pub fn new<S: CollectorSpawner + 'static>(spawner: S, dump_dir: PathBuf, dump_file: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            spawner: Box::new(spawner),
            dump_dir,
            dump_file,
            collectors: Mutex::new(HashMap::new()),
            buckets: Mutex::new(Vec::new()),
            last_dump: Mutex::new(None),
            stop: AtomicBool::new(false),
        })
    }

    /// Start the collector for the capture type, unless it is already running.
    pub fn ensure_collector(&self, capture: CaptureType) -> Result<(), BucketError> {
        let mut collectors = lock(&self.collectors);
        if let Some(handle) = collectors.get_mut(&capture) {
            if handle.is_running() {
                debug!("{} collector already running", capture.daemon());
                return Ok(());
            }
        }
        let handle = self.spawner.spawn(capture, &self.dump_dir)?;
        collectors.insert(capture, handle);
        Ok(())
    }

    /// Returns the capture types of all running collectors
    pub fn running(&self) -> HashSet<CaptureType> {
        lock(&self.collectors)
            .iter_mut()
            .filter_map(|(c, h)| if h.is_running() { Some(*c) } else { None })
            .collect()
    }

    fn attach(&self, bucket: &Arc<NetflowBucket>) {
        lock(&self.buckets).push(Arc::downgrade(bucket));
    }

    /// Returns the number of live buckets
    pub fn live_buckets(&self) -> usize {
        let mut buckets = lock(&self.buckets);
        buckets.retain(|b| b.strong_count() > 0);
        buckets.len()
    }

    /// Read the dump file and deliver its records to every live bucket.
    pub fn deliver_dump(&self) -> Result<usize, BucketError> {
        let content = fs::read_to_string(&self.dump_file)
            .map_err(|e| BucketError::DumpUnreadable(e.to_string()))?;
        let records = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_record)
            .collect::<Result<Vec<_>, _>>()?;
        let buckets: Vec<Arc<NetflowBucket>> = {
            let mut buckets = lock(&self.buckets);
            buckets.retain(|b| b.strong_count() > 0);
            buckets.iter().filter_map(Weak::upgrade).collect()
        };
        for b in buckets.iter() {
            b.deliver(&records);
        }
        Ok(records.len())
    }

    /// Deliver the dump if it changed since the last call. Returns `true` if it was delivered.
    pub fn poll_dump(&self) -> Result<bool, BucketError> {
        let modified = match fs::metadata(&self.dump_file).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => return Ok(false),
        };
        {
            let mut last = lock(&self.last_dump);
            if *last == Some(modified) {
                return Ok(false);
            }
            *last = Some(modified);
        }
        self.deliver_dump()?;
        Ok(true)
    }

    /// Spawn a thread polling the dump file until [`Self::shutdown`] is called.
    pub fn start_watcher(self: &Arc<Self>, interval: Duration) -> thread::JoinHandle<()> {
        let hub = self.clone();
        thread::spawn(move || {
            while !hub.stop.load(Ordering::SeqCst) {
                if let Err(e) = hub.poll_dump() {
                    warn!("{}", e);
                }
                thread::sleep(interval);
            }
        })
    }

    /// Stop the watcher and all collectors
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        for (capture, mut handle) in lock(&self.collectors).drain() {
            info!("Stopping {} collector", capture.daemon());
            handle.terminate();
        }
    }
}

/// # Netflow Bucket
/// Receives the flow records of the collector. The matches of the rules the bucket is installed
/// on are tracked, but records are delivered unfiltered.
pub struct NetflowBucket {
    id: usize,
    capture: CaptureType,
    matches: Mutex<HashSet<Match>>,
    in_update: AtomicBool,
    callbacks: Mutex<Vec<Callback<Vec<Packet>>>>,
}

impl NetflowBucket {
    /// Create a new bucket, starting the collector if it is not running yet.
    pub fn new(capture: CaptureType, hub: &Arc<CollectorHub>) -> Result<Arc<Self>, BucketError> {
        hub.ensure_collector(capture)?;
        let bucket = Arc::new(Self {
            id: crate::next_id(),
            capture,
            matches: Mutex::new(HashSet::new()),
            in_update: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
        });
        hub.attach(&bucket);
        Ok(bucket)
    }

    /// Unique id of the bucket
    pub fn id(&self) -> usize {
        self.id
    }

    /// Capture type of the bucket
    pub fn capture(&self) -> CaptureType {
        self.capture
    }

    /// Register a callback receiving every dump of records
    pub fn register_callback<F: Fn(&Vec<Packet>) + Send + Sync + 'static>(&self, f: F) {
        lock(&self.callbacks).push(Box::new(f));
    }

    fn deliver(&self, records: &Vec<Packet>) {
        dispatch(self.id, &lock(&self.callbacks), records);
    }

    /// Mark the start of a bulk update of the matches.
    pub fn start_update(&self) {
        self.in_update.store(true, Ordering::SeqCst);
    }

    /// Mark the end of a bulk update of the matches.
    pub fn finish_update(&self) {
        self.in_update.store(false, Ordering::SeqCst);
    }

    /// Returns `true` while a bulk update is in progress
    pub fn is_updating(&self) -> bool {
        self.in_update.load(Ordering::SeqCst)
    }

    /// Track the match of an installed rule
    pub fn add_match(&self, m: Match) {
        lock(&self.matches).insert(m);
    }

    /// Stop tracking the match of a deleted rule
    pub fn delete_match(&self, m: &Match) {
        lock(&self.matches).remove(m);
    }

    /// Forget all matches
    pub fn clear_matches(&self) {
        lock(&self.matches).clear();
    }

    /// Returns the tracked matches
    pub fn matches(&self) -> HashSet<Match> {
        lock(&self.matches).clone()
    }
}
