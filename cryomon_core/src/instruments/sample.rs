//! Demo poller posting random-walk values.
//!
//! No hardware behind it; used to exercise a freshly registered fridge's
//! server pipeline end to end before real instruments are wired up.

use std::collections::BTreeMap;
use std::sync::Arc;

use cryomon_config::{SampleCfg, UploadCfg};
use rand::Rng;

use crate::error::Result;
use crate::instruments::upload_due;
use crate::time::WallClock;
use crate::upload::{Batch, UploadClient};
use crate::{Poller, Progress};

/// Largest move one field makes per upload.
const WALK_STEP: f64 = 0.05;

pub struct SampleMonitor {
    client: UploadClient,
    wall: Arc<dyn WallClock>,
    interval: chrono::Duration,
    values: BTreeMap<String, f64>,
}

impl SampleMonitor {
    pub fn new(cfg: &SampleCfg, upload: &UploadCfg, wall: Arc<dyn WallClock>) -> Result<Self> {
        let mut client = UploadClient::new(upload, cfg.supp.clone(), Arc::clone(&wall))?;
        client.seed_latest()?;
        let values = cfg.fields.iter().map(|f| (f.clone(), 0.5)).collect();
        Ok(Self {
            client,
            wall,
            interval: chrono::Duration::milliseconds((cfg.interval_s * 1000.0) as i64),
            values,
        })
    }

    fn step(&mut self) {
        let mut rng = rand::thread_rng();
        for value in self.values.values_mut() {
            *value = (*value + rng.gen_range(-WALK_STEP..=WALK_STEP)).clamp(0.0, 1.0);
        }
    }
}

impl Poller for SampleMonitor {
    fn name(&self) -> &str {
        "sample"
    }

    fn poll(&mut self) -> Result<Progress> {
        let now = self.wall.now();
        if !upload_due(now, self.client.latest(), self.interval) {
            return Ok(Progress::Idle);
        }
        self.step();
        let mut batch = Batch::new(now);
        for (field, value) in &self.values {
            batch.insert(field.clone(), *value);
        }
        self.client.upload(&batch)?;
        Ok(Progress::Advanced)
    }
}
