//! The background monitoring thread.
//!
//! Every 50 ms it takes one consistent counter reading (through the same
//! mutex the pipeline uses) and appends the per-event delta against its
//! own previous reading to the monitoring stream. Its deltas and the
//! pipeline's are independent accountings of the same underlying
//! counters; each reader diffs against what it last saw.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, LineWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::{EventKind, CSV_HEADER, EVENT_ORDER};
use crate::pipeline::{Pipeline, Reading};
use crate::reentry;

/// Set at teardown; the sampler exits on its next iteration.
pub static STOP: AtomicBool = AtomicBool::new(false);

pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// Start the sampler against the process-wide pipeline.
pub fn spawn(
    pipeline: &'static Pipeline,
    mut monitoring: LineWriter<File>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("counter-sampler".into())
        .spawn(move || reentry::guarded(|| run(pipeline, &mut monitoring)))
}

fn run(pipeline: &'static Pipeline, monitoring: &mut LineWriter<File>) {
    if let Err(e) = writeln!(monitoring, "{}", CSV_HEADER) {
        log::warn!("failed to write the monitoring header: {}", e);
    }

    let mut last: HashMap<EventKind, u64> = EVENT_ORDER.iter().map(|ev| (*ev, 0)).collect();

    while !STOP.load(Ordering::Relaxed) {
        let reading = pipeline.read_counters();
        let line = sample_line(&reading, &mut last);
        if let Err(e) = monitoring.write_all(line.as_bytes()) {
            log::warn!("failed to write a monitoring sample: {}", e);
        }
        thread::sleep(SAMPLE_INTERVAL);
    }
    log::debug!("sampler stopped");
}

/// Format one monitoring record and roll `last` forward.
fn sample_line(reading: &Reading, last: &mut HashMap<EventKind, u64>) -> String {
    let mut line = String::new();
    for event in EVENT_ORDER {
        let value = reading.value(event);
        let previous = last.insert(event, value).unwrap_or(0);
        line.push_str(&format!("{},", value.saturating_sub(previous)));
    }
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn samples_are_deltas_against_the_previous_read() {
        let mut last: HashMap<EventKind, u64> =
            EVENT_ORDER.iter().map(|ev| (*ev, 0)).collect();

        assert_eq!(sample_line(&reading(10, 20, 30), &mut last), "10,20,30,\n");
        assert_eq!(sample_line(&reading(15, 45, 90), &mut last), "5,25,60,\n");
        // a stalled counter reads as zero delta, never negative
        assert_eq!(sample_line(&reading(12, 45, 90), &mut last), "0,0,0,\n");
    }
}
