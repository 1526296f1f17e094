use std::{
    collections::{BTreeSet, HashMap},
    fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    adapter::Adapter,
    reconcile::{reconcile, ReconcileCtx},
    session::FgcSession,
    worker::{AreaProgramManager, Job, MAX_NUM_WORKERS},
    Error, Result,
};

/// Cadence of the server loop.
pub const ITERATION_STATUS_SRV_SEC: u64 = 5;
/// Status-feed refresh period; records older than twice this are stale.
pub const STATUS_SRV_REFRESH_SEC: u64 = 5;
/// Unlatched status flag requesting a REGFGC3 synchronisation.
pub const SYNC_FLAG: &str = "SYNC_REGFGC3";
/// Device name of the fleet status service.
pub const STATUS_SRV_DEVICE: &str = "FGC_STATUS";
/// Property carrying the all-gateways snapshot on the status service.
pub const STATUS_ALL_PROP: &str = "STATUS.ALL";

/// Latched status of one device as published by the status feed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceStatus {
    #[serde(rename = "ST_UNLATCHED", default)]
    pub st_unlatched: String,
}

/// Status of one gateway and its devices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GatewayStatus {
    pub recv_time_sec: u64,
    #[serde(default)]
    pub devices: HashMap<String, DeviceStatus>,
}

/// All-gateways snapshot.
pub type StatusSnapshot = HashMap<String, GatewayStatus>;

/// Source of fleet status snapshots.
pub trait StatusFeed: Send {
    fn get_status_all(&mut self) -> Result<StatusSnapshot>;

    fn disconnect(&mut self);
}

/// Opens status-feed sessions; the server reconnects through this after a
/// feed failure.
pub type StatusConnector = Box<dyn Fn() -> Result<Box<dyn StatusFeed>> + Send>;

/// [StatusFeed] reading the snapshot as one JSON property from the status
/// service session.
pub struct PropertyStatusFeed {
    session: Box<dyn FgcSession>,
}

impl PropertyStatusFeed {
    /// Wraps an open session to the status service.
    pub fn new(session: Box<dyn FgcSession>) -> Self {
        Self { session }
    }
}

impl StatusFeed for PropertyStatusFeed {
    fn get_status_all(&mut self) -> Result<StatusSnapshot> {
        let reply = self.session.get(STATUS_ALL_PROP)?;

        serde_json::from_str(reply.value.as_str())
            .map_err(|e| Error::rpc(format!("malformed status snapshot: {e}")))
    }

    fn disconnect(&mut self) {
        if let Err(e) = self.session.disconnect() {
            warn!("could not close status feed session: {e}");
        }
    }
}

/// Directory entry for one device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceEntry {
    pub class_id: u32,
    pub gateway: String,
}

/// Directory entry for one gateway.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GatewayEntry {
    pub groups: Vec<String>,
}

/// Name/group directory: maps device -> gateway -> area.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Directory {
    pub devices: HashMap<String, DeviceEntry>,
    pub gateways: HashMap<String, GatewayEntry>,
}

impl Directory {
    /// Loads the directory from its JSON name file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|_| Error::not_found(format!("name file {} not found", path.display())))?;

        serde_json::from_str(contents.as_str())
            .map_err(|e| Error::parse(format!("name file {}: {e}", path.display())))
    }

    /// Gets every known area.
    pub fn groups(&self) -> BTreeSet<String> {
        self.gateways
            .values()
            .flat_map(|gw| gw.groups.iter().cloned())
            .collect()
    }

    /// Resolves a device to its area (the first group of its gateway).
    pub fn area_of(&self, device: &str) -> Option<&str> {
        let entry = self.devices.get(device)?;
        let gateway = self.gateways.get(entry.gateway.as_str())?;

        gateway.groups.first().map(String::as_str)
    }
}

/// Selects the devices requesting synchronisation from a status snapshot.
///
/// Only gateways whose record is fresh (received within
/// `2 x STATUS_SRV_REFRESH_SEC` of `now_sec`) are considered; a device
/// qualifies when its `ST_UNLATCHED` field contains [SYNC_FLAG] and the
/// directory knows its area.
pub fn filter_jobs(
    snapshot: &StatusSnapshot,
    directory: &Directory,
    now_sec: u64,
) -> Vec<(String, String)> {
    let horizon = now_sec.saturating_sub(2 * STATUS_SRV_REFRESH_SEC);
    let mut jobs = Vec::new();

    for gateway in snapshot.values() {
        if gateway.recv_time_sec < horizon {
            continue;
        }

        for (device, status) in &gateway.devices {
            if !status.st_unlatched.contains(SYNC_FLAG) {
                continue;
            }

            if let Some(area) = directory.area_of(device.as_str()) {
                jobs.push((device.clone(), area.to_string()));
            }
        }
    }

    jobs
}

/// Top-level control loop: watches the status feed and dispatches
/// reconciliation jobs to the area pools.
pub struct ProgramManagerServer {
    directory: Directory,
    adapter: Arc<dyn Adapter>,
    ctx: Arc<ReconcileCtx>,
    connect_status: StatusConnector,
    cadence: Duration,
    stop: Arc<AtomicBool>,
    area_pms: HashMap<String, AreaProgramManager>,
    status_conn: Option<Box<dyn StatusFeed>>,
}

impl ProgramManagerServer {
    /// Creates a server; pools are started by [start](Self::start).
    pub fn new(
        directory: Directory,
        adapter: Arc<dyn Adapter>,
        ctx: Arc<ReconcileCtx>,
        connect_status: StatusConnector,
    ) -> Self {
        Self {
            directory,
            adapter,
            ctx,
            connect_status,
            cadence: Duration::from_secs(ITERATION_STATUS_SRV_SEC),
            stop: Arc::new(AtomicBool::new(false)),
            area_pms: HashMap::new(),
            status_conn: None,
        }
    }

    /// Overrides the loop cadence.
    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }

    /// Handle on the run flag; storing `true` makes [start](Self::start)
    /// return after the current iteration.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Runs the main loop until the stop flag is raised.
    pub fn start(&mut self) {
        info!("starting Program Manager Server");

        for area in self.directory.groups() {
            info!("starting AreaProgramManager({area})");
            self.area_pms.insert(
                area.clone(),
                AreaProgramManager::new(area.as_str(), self.adapter.clone(), MAX_NUM_WORKERS),
            );
        }

        let ctx = self.ctx.clone();
        let job: Job = Arc::new(move |converter, adapter| reconcile(converter, adapter, &ctx));

        while !self.stop.load(Ordering::SeqCst) {
            let snapshot = self.fetch_status();
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);

            self.dispatch(&snapshot, now, &job);

            thread::sleep(self.cadence);
        }
    }

    /// Stops the server: raises the run flag, then drains every pool
    /// (in-flight work finishes, nothing is cancelled), then closes the
    /// status session.
    pub fn stop(&mut self) {
        info!("stopping Program Manager Server");

        self.stop.store(true, Ordering::SeqCst);

        for pool in self.area_pms.values_mut() {
            pool.drain();
        }

        self.clean_status_conn();

        info!("Program Manager Server stopped");
    }

    fn fetch_status(&mut self) -> StatusSnapshot {
        if self.status_conn.is_none() {
            match (self.connect_status)() {
                Ok(feed) => self.status_conn = Some(feed),
                Err(e) => {
                    warn!("could not establish connection with status server: {e}");
                    return StatusSnapshot::default();
                }
            }
        }

        let result = match self.status_conn.as_mut() {
            Some(feed) => feed.get_status_all(),
            None => return StatusSnapshot::default(),
        };

        match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Drop the session; the next iteration rebuilds it.
                warn!("error in ProgramManagerServer: {e}");
                self.clean_status_conn();
                StatusSnapshot::default()
            }
        }
    }

    fn dispatch(&self, snapshot: &StatusSnapshot, now_sec: u64, job: &Job) {
        for (device, area) in filter_jobs(snapshot, &self.directory, now_sec) {
            if let Some(pool) = self.area_pms.get(area.as_str()) {
                pool.submit(job.clone(), device.as_str());
            }
        }
    }

    fn clean_status_conn(&mut self) {
        if let Some(mut feed) = self.status_conn.take() {
            feed.disconnect();
        }
    }
}
