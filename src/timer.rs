/*!
Named phase timings.

A [`PhaseTimer`] belongs to one workflow run. Phases are recorded in the order they begin, and
beginning a phase closes the one before it, so a sequence of steps only needs a final
[`finish`](PhaseTimer::finish).

```
# use vadd_offload::timer::PhaseTimer;
let mut timer = PhaseTimer::new();
timer.begin("Allocating memory buffer");
timer.begin("Populating buffer inputs");
timer.finish();
let report = timer.report();
assert_eq!(report.len(), 2);
println!("{report}");
```
*/

use std::{
    fmt::{self, Display},
    time::{Duration, Instant},
};

/// A recorded phase.
#[derive(Clone, Debug)]
pub struct Phase {
    label: String,
    start: Instant,
    end: Option<Instant>,
}

impl Phase {
    /// The label.
    pub fn label(&self) -> &str {
        &self.label
    }
    /// When the phase began.
    pub fn start(&self) -> Instant {
        self.start
    }
    /// When the phase ended, None if still open.
    pub fn end(&self) -> Option<Instant> {
        self.end
    }
    /// The elapsed time, None if still open.
    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end.duration_since(self.start))
    }
    fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

/// Append only record of named phases.
#[derive(Debug, Default)]
pub struct PhaseTimer {
    phases: Vec<Phase>,
}

impl PhaseTimer {
    /// An empty timer.
    pub fn new() -> Self {
        Self::default()
    }
    /// Begins a phase, finishing the current phase if any.
    pub fn begin(&mut self, label: impl Into<String>) {
        self.finish();
        let label = label.into();
        tracing::debug!(phase = %label, "begin");
        self.phases.push(Phase {
            label,
            start: Instant::now(),
            end: None,
        });
    }
    /// Finishes the current phase.
    ///
    /// Does nothing if no phase is open.
    pub fn finish(&mut self) {
        if let Some(phase) = self.phases.last_mut().filter(|phase| phase.is_open()) {
            let end = Instant::now();
            phase.end.replace(end);
            tracing::debug!(
                phase = %phase.label,
                elapsed = ?end.duration_since(phase.start),
                "finish"
            );
        }
    }
    /// The phases recorded so far, in order.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }
    /// Finishes the current phase and drains the timer into a report.
    pub fn report(mut self) -> PhaseReport {
        self.finish();
        let rows = self
            .phases
            .into_iter()
            .map(|phase| {
                let duration = phase.duration().unwrap_or_default();
                (phase.label, duration)
            })
            .collect();
        PhaseReport { rows }
    }
}

/** Phase durations, ready to print.

Displays one line per phase, labels padded to the longest label:
```text
OpenCL Initialization   : 251.308 ms
Allocating memory buffer: 0.012 ms
```
*/
#[derive(Clone, Debug, Default)]
pub struct PhaseReport {
    rows: Vec<(String, Duration)>,
}

impl PhaseReport {
    /// The number of phases.
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    /// No phases were recorded.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    /// Label and duration of each phase, in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Duration)> + '_ {
        self.rows
            .iter()
            .map(|(label, duration)| (label.as_str(), *duration))
    }
    /// The duration of the first phase with `label`.
    pub fn get(&self, label: &str) -> Option<Duration> {
        self.iter()
            .find(|(x, _)| *x == label)
            .map(|(_, duration)| duration)
    }
}

impl Display for PhaseReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let width = self
            .rows
            .iter()
            .map(|(label, _)| label.chars().count())
            .max()
            .unwrap_or(0);
        for (label, duration) in self.rows.iter() {
            let ms = duration.as_secs_f64() * 1000.;
            writeln!(f, "{label:<width$}: {ms:.3} ms")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_finishes_previous() {
        let mut timer = PhaseTimer::new();
        timer.begin("a");
        timer.begin("b");
        let phases = timer.phases();
        assert_eq!(phases.len(), 2);
        assert!(phases[0].duration().is_some());
        assert!(phases[1].duration().is_none());
        assert!(phases[0].end().unwrap() <= phases[1].start());
    }

    #[test]
    fn finish_without_phase() {
        let mut timer = PhaseTimer::new();
        timer.finish();
        timer.begin("a");
        timer.finish();
        let end = timer.phases()[0].end();
        timer.finish();
        assert_eq!(timer.phases()[0].end(), end);
    }

    #[test]
    fn report_keeps_order() {
        let mut timer = PhaseTimer::new();
        for label in ["third", "first", "second"] {
            timer.begin(label);
        }
        let report = timer.report();
        let labels: Vec<_> = report.iter().map(|(label, _)| label).collect();
        assert_eq!(labels, ["third", "first", "second"]);
        assert!(report.get("first").is_some());
        assert!(report.get("fourth").is_none());
    }

    #[test]
    fn report_display() {
        let report = PhaseReport {
            rows: vec![
                ("Software VADD run".to_string(), Duration::from_micros(1500)),
                ("Set args".to_string(), Duration::from_millis(2)),
            ],
        };
        assert_eq!(
            report.to_string(),
            "Software VADD run: 1.500 ms\nSet args         : 2.000 ms\n"
        );
    }
}
