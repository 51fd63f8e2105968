//! The predict-measure-feed cycle around every parallel region.
//!
//! Each intercepted dispatch goes through [`Pipeline::region_call`]: look
//! up (or discover) the region, capture its feature vector once, write one
//! prediction record, snapshot the counters, run the real dispatch,
//! snapshot again, then write one measurement record and feed the deltas
//! back into the region's models. The captured features are reused for the
//! feedback so prediction and training always see identical inputs.
//!
//! Counter access is shared with the background sampler and serialized by
//! one mutex; region state and the progress stream have their own. No
//! thread takes more than one of them at a time.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::counters::{CounterGroup, Snapshot};
use crate::energy::EnergyCounter;
use crate::error::Error;
use crate::events::{EventKind, CSV_HEADER};
use crate::extract::{self, SlotMap, NR_METRICS};
use crate::output;
use crate::predictor::{EventModels, PredictorKind};
use crate::registry::AllocationRegistry;
use crate::{reentry, shim};

/// One combined reading of the hardware group and the energy counter.
pub struct Reading {
    pub hw: Snapshot,
    pub energy: u64,
}

impl Reading {
    pub fn value(&self, event: EventKind) -> u64 {
        match event {
            EventKind::Energy => self.energy,
            other => self.hw.get(&other).copied().unwrap_or(0),
        }
    }

    /// Per-event difference against an earlier reading, clamped at zero.
    pub fn delta_from(&self, before: &Reading, event: EventKind) -> u64 {
        self.value(event).saturating_sub(before.value(event))
    }
}

/// The counter handles shared between the pipeline and the sampler.
pub struct CounterStack {
    pub group: CounterGroup,
    pub energy: EnergyCounter,
}

impl CounterStack {
    pub fn read(&mut self) -> Reading {
        Reading {
            hw: self.group.read(),
            energy: self.energy.read(),
        }
    }
}

/// Everything the shim keeps for one discovered region.
pub struct Region {
    pub id: u64,
    slots: SlotMap,
    models: EventModels,
    measurements: LineWriter<File>,
    predictions: LineWriter<File>,
}

impl Region {
    /// Create the region's two output streams (with headers) and its
    /// models.
    pub fn create(id: u64, kind: PredictorKind, root: &Path) -> io::Result<Region> {
        let name = output::region_file_name(id);
        let measurements = output::create_with_header(
            root.join(output::MEASUREMENTS_DIR).join(&name),
            CSV_HEADER,
        )?;
        let predictions = output::create_with_header(
            root.join(output::PREDICTIONS_DIR).join(&name),
            CSV_HEADER,
        )?;

        Ok(Region {
            id,
            slots: SlotMap::new(),
            models: EventModels::new(kind),
            measurements,
            predictions,
        })
    }

    /// Build this call's feature vector, assigning slots to any newly
    /// discovered embedded addresses.
    pub fn features_for(
        &mut self,
        payload: usize,
        registry: &AllocationRegistry,
        thread_count: u32,
    ) -> [f64; NR_METRICS] {
        extract::extract(
            payload,
            extract::stack_bounds(),
            registry,
            &mut self.slots,
            thread_count,
        )
    }

    /// Query every model and write one prediction record.
    pub fn predict_all(&mut self, features: &[f64; NR_METRICS]) {
        let mut record = String::new();
        for (event, model) in self.models.iter_mut() {
            let predicted = model.predict(features);
            log::debug!("region {}: predicted {} for {}", self.id, predicted, event.name());
            record.push_str(&format!("{},", predicted));
        }
        record.push('\n');
        if let Err(e) = self.predictions.write_all(record.as_bytes()) {
            log::warn!("failed to write prediction record: {}", e);
        }
    }

    /// Write one measurement record and feed each delta to its model.
    pub fn absorb(&mut self, features: &[f64; NR_METRICS], before: &Reading, after: &Reading) {
        let mut record = String::new();
        for (event, model) in self.models.iter_mut() {
            let delta = after.delta_from(before, event);
            log::debug!("region {}: measured {} for {}", self.id, delta, event.name());
            record.push_str(&format!("{},", delta));
            model.fit(features, delta as f64);
        }
        record.push('\n');
        if let Err(e) = self.measurements.write_all(record.as_bytes()) {
            log::warn!("failed to write measurement record: {}", e);
        }
    }
}

/// All regions discovered so far, keyed by work-function address.
pub struct RegionTable {
    root: PathBuf,
    kind: PredictorKind,
    regions: HashMap<usize, Region>,
}

impl RegionTable {
    pub fn new(root: impl Into<PathBuf>, kind: PredictorKind) -> RegionTable {
        RegionTable {
            root: root.into(),
            kind,
            regions: HashMap::new(),
        }
    }

    /// The region for `fn_addr`, discovering it (next dense id, fresh
    /// output streams) on first sight.
    pub fn ensure(&mut self, fn_addr: usize) -> io::Result<&mut Region> {
        let next_id = self.regions.len() as u64 + 1;
        match self.regions.entry(fn_addr) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(slot) => {
                log::info!("discovered region {} at {:#x}", next_id, fn_addr);
                let region = Region::create(next_id, self.kind, &self.root)?;
                Ok(slot.insert(region))
            }
        }
    }

    pub fn get_mut(&mut self, fn_addr: usize) -> Option<&mut Region> {
        self.regions.get_mut(&fn_addr)
    }
}

/// The line recorded in the progress stream for one pipeline call.
pub(crate) fn progress_line(region_id: u64, features: &[f64; NR_METRICS]) -> String {
    let mut line = region_id.to_string();
    for value in features {
        line.push_str(&format!(",{}", value));
    }
    line.push('\n');
    line
}

/// Process-wide pipeline state.
pub struct Pipeline {
    counters: Mutex<CounterStack>,
    table: Mutex<RegionTable>,
    progress: Mutex<LineWriter<File>>,
}

impl Pipeline {
    /// Open counters and output files. Any failure here means the shim
    /// cannot do its job; callers treat it as fatal.
    pub fn start_up(root: &Path, kind: PredictorKind) -> Result<Pipeline, Error> {
        let pid = unsafe { libc::getpid() };
        let group = CounterGroup::open(pid).ok_or(Error::NoCounters)?;
        let energy = EnergyCounter::open();

        output::create_tree(root)?;
        let progress =
            output::create_with_header(root.join("progress.csv"), output::PROGRESS_HEADER)?;

        Ok(Pipeline {
            counters: Mutex::new(CounterStack { group, energy }),
            table: Mutex::new(RegionTable::new(root, kind)),
            progress: Mutex::new(progress),
        })
    }

    /// One consistent counter reading, shared with the sampler.
    pub fn read_counters(&self) -> Reading {
        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        counters.read()
    }

    /// Wrap one real dispatch with predict / measure / feed.
    ///
    /// `run` is invoked exactly once, whatever happens around it.
    pub fn region_call(
        &self,
        fn_addr: usize,
        payload: usize,
        thread_count: u32,
        run: impl FnOnce(),
    ) {
        let (features, before) =
            reentry::guarded(|| self.begin(fn_addr, payload, thread_count));

        run();

        reentry::guarded(|| {
            let after = self.read_counters();
            let mut table = match self.table.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(region) = table.get_mut(fn_addr) {
                region.absorb(&features, &before, &after);
            }
        });
    }

    fn begin(
        &self,
        fn_addr: usize,
        payload: usize,
        thread_count: u32,
    ) -> ([f64; NR_METRICS], Reading) {
        let features;
        let region_id;
        {
            let mut table = match self.table.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let region = match table.ensure(fn_addr) {
                Ok(region) => region,
                Err(e) => {
                    log::error!("cannot create output streams for a new region: {}", e);
                    std::process::exit(1);
                }
            };
            region_id = region.id;
            features = region.features_for(payload, &shim::REGISTRY, thread_count);
            region.predict_all(&features);
        }

        {
            let mut progress = match self.progress.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(e) = progress.write_all(progress_line(region_id, &features).as_bytes()) {
                log::warn!("failed to write progress record: {}", e);
            }
        }

        (features, self.read_counters())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::fs;

    fn reading(cache_misses: u64, energy: u64, instructions: u64) -> Reading {
        Reading {
            hw: [
                (EventKind::CacheMisses, cache_misses),
                (EventKind::Instructions, instructions),
            ]
            .into(),
            energy,
        }
    }

    #[test]
    fn region_ids_are_dense_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        output::create_tree(dir.path()).unwrap();
        let mut table = RegionTable::new(dir.path(), PredictorKind::Llsp);

        assert_eq!(table.ensure(0x1111).unwrap().id, 1);
        assert_eq!(table.ensure(0x2222).unwrap().id, 2);
        assert_eq!(table.ensure(0x1111).unwrap().id, 1);
        assert_eq!(table.ensure(0x3333).unwrap().id, 3);
    }

    #[test]
    fn discovery_creates_both_streams_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        output::create_tree(dir.path()).unwrap();
        let mut table = RegionTable::new(dir.path(), PredictorKind::Llsp);
        table.ensure(0xaaaa).unwrap();
        drop(table);

        for sub in [output::MEASUREMENTS_DIR, output::PREDICTIONS_DIR] {
            let contents = fs::read_to_string(dir.path().join(sub).join("01.csv")).unwrap();
            assert_eq!(contents, "Cache_Misses,Energy,Instructions,\n");
        }
    }

    #[test]
    fn first_prediction_is_the_prior_and_later_ones_are_not() {
        let dir = tempfile::tempdir().unwrap();
        output::create_tree(dir.path()).unwrap();
        let mut region = Region::create(1, PredictorKind::Llsp, dir.path()).unwrap();

        let mut features = [0.0; NR_METRICS];
        features[0] = 2.0;
        features[1] = 4000.0;

        region.predict_all(&features);
        region.absorb(&features, &reading(0, 0, 0), &reading(120, 900, 5000));
        region.predict_all(&features);
        drop(region);

        let predictions =
            fs::read_to_string(dir.path().join(output::PREDICTIONS_DIR).join("01.csv")).unwrap();
        let mut lines = predictions.lines().skip(1);
        assert_eq!(lines.next(), Some("0,0,0,"));

        let second: Vec<f64> = lines
            .next()
            .unwrap()
            .trim_end_matches(',')
            .split(',')
            .map(|v| v.parse().unwrap())
            .collect();
        assert!((second[0] - 120.0).abs() < 1.0);
        assert!((second[1] - 900.0).abs() < 1.0);
        assert!((second[2] - 5000.0).abs() < 1.0);

        let measurements =
            fs::read_to_string(dir.path().join(output::MEASUREMENTS_DIR).join("01.csv")).unwrap();
        assert_eq!(measurements.lines().nth(1), Some("120,900,5000,"));
    }

    #[test]
    fn deltas_clamp_at_zero() {
        let before = reading(100, 100, 100);
        let after = reading(90, 150, 400);
        assert_eq!(after.delta_from(&before, EventKind::CacheMisses), 0);
        assert_eq!(after.delta_from(&before, EventKind::Energy), 50);
        assert_eq!(after.delta_from(&before, EventKind::Instructions), 300);
    }

    #[test]
    fn progress_line_lists_region_then_all_features() {
        let mut features = [0.0; NR_METRICS];
        features[0] = 2.0;
        features[1] = 4000.0;
        assert_eq!(
            progress_line(1, &features),
            "1,2,4000,0,0,0,0,0,0,0,0\n"
        );
    }
}
