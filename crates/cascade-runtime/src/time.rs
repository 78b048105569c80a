//! Time-driven nodes
//!
//! Interval and Wait derive their change signal from elapsed time rather
//! than upstream data. Firing conditions are evaluated only on timer-tick
//! cycles and allow an early-fire margin (the tolerance) so host scheduling
//! jitter never delays a control loop by a whole period.

use std::time::Duration;

use tracing::trace;

use cascade_ir as ir;
use cascade_ir::ParamName;

use crate::error::{Error, Result};
use crate::factory::NodeFactory;
use crate::node::{Context, Node, RunReason};

/// Default output parameter of the time nodes.
pub const OUTPUT_PARAM: &str = "output";

/// Fixed tolerance floor absorbing host scheduling jitter even when the
/// timing base is tiny or undefined.
pub const MIN_TOLERANCE: Duration = Duration::from_millis(5);

/// Early-fire tolerance for a program with the given timing base (the GCD
/// of every configured period and duration). A coarser base means looser
/// tolerance; no timers at all means the floor.
pub fn tolerance(base: Option<Duration>) -> Duration {
    match base {
        Some(base) if base / 2 > MIN_TOLERANCE => base / 2,
        _ => MIN_TOLERANCE,
    }
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// The pulse last emitted on the default output, with its timestamp.
#[derive(Debug, Default)]
struct Pulse {
    value: u8,
    at: Option<Duration>,
}

impl Pulse {
    fn fire(&mut self, at: Duration) {
        self.value = 1;
        self.at = Some(at);
    }

    fn clear(&mut self) {
        self.value = 0;
        self.at = None;
    }

    fn is_truthy(&self) -> bool {
        self.value != 0
    }
}

/// Fires repeatedly, once per period, for the life of the program.
///
/// The first timer tick always fires; afterwards the node fires whenever
/// `elapsed - last_fired >= period - tolerance`.
#[derive(Debug)]
pub struct Interval {
    period: Duration,
    last_fired: Option<Duration>,
    pulse: Pulse,
}

impl Interval {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_fired: None,
            pulse: Pulse::default(),
        }
    }

    pub fn from_config(decl: &ir::Node) -> Result<Self> {
        Ok(Self::new(duration_param(decl, "period")?))
    }

    /// Timestamp of the most recent firing, if any.
    pub fn fired_at(&self) -> Option<Duration> {
        self.pulse.at
    }
}

impl Node for Interval {
    fn next(&mut self, ctx: &mut Context) {
        if ctx.reason != RunReason::TimerTick {
            return;
        }
        let due = match self.last_fired {
            None => true,
            Some(last) => {
                ctx.elapsed.saturating_sub(last) >= self.period.saturating_sub(ctx.tolerance)
            }
        };
        if !due {
            return;
        }
        self.last_fired = Some(ctx.elapsed);
        self.pulse.fire(ctx.elapsed);
        trace!(elapsed = ?ctx.elapsed, "interval fired");
        ctx.mark_changed(OUTPUT_PARAM);
    }

    fn reset(&mut self) {
        self.last_fired = None;
        self.pulse.clear();
    }

    fn is_output_truthy(&self, param: &ParamName) -> bool {
        param.as_str() == OUTPUT_PARAM && self.pulse.is_truthy()
    }
}

/// Fires exactly once, a fixed duration after its first timer tick.
///
/// The duration is measured from the first `next` call after construction
/// or reset, not from construction itself. Once fired, every further step
/// is a no-op until `reset` (normally stage re-entry) clears it.
#[derive(Debug)]
pub struct Wait {
    duration: Duration,
    started: Option<Duration>,
    fired: bool,
    pulse: Pulse,
}

impl Wait {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            started: None,
            fired: false,
            pulse: Pulse::default(),
        }
    }

    pub fn from_config(decl: &ir::Node) -> Result<Self> {
        Ok(Self::new(duration_param(decl, "duration")?))
    }

    pub fn fired_at(&self) -> Option<Duration> {
        self.pulse.at
    }
}

impl Node for Wait {
    fn next(&mut self, ctx: &mut Context) {
        if ctx.reason != RunReason::TimerTick {
            return;
        }
        if self.fired {
            return;
        }
        let started = *self.started.get_or_insert(ctx.elapsed);
        if ctx.elapsed.saturating_sub(started) < self.duration.saturating_sub(ctx.tolerance) {
            return;
        }
        self.fired = true;
        self.pulse.fire(ctx.elapsed);
        trace!(elapsed = ?ctx.elapsed, "wait fired");
        ctx.mark_changed(OUTPUT_PARAM);
    }

    fn reset(&mut self) {
        self.started = None;
        self.fired = false;
        self.pulse.clear();
    }

    fn is_output_truthy(&self, param: &ParamName) -> bool {
        param.as_str() == OUTPUT_PARAM && self.pulse.is_truthy()
    }
}

fn duration_param(decl: &ir::Node, name: &str) -> Result<Duration> {
    let value = decl
        .config
        .get(&ParamName::from(name))
        .ok_or_else(|| Error::MissingConfig {
            node: decl.key.clone(),
            param: name.to_string(),
        })?;
    let nanos = value.as_i64().ok_or_else(|| Error::InvalidConfig {
        node: decl.key.clone(),
        param: name.to_string(),
        message: "expected integer nanoseconds".to_string(),
    })?;
    if nanos < 0 {
        return Err(Error::InvalidConfig {
            node: decl.key.clone(),
            param: name.to_string(),
            message: "duration must not be negative".to_string(),
        });
    }
    Ok(Duration::from_nanos(nanos as u64))
}

/// Creates `interval` and `wait` nodes and accumulates the timing base: the
/// GCD of every period and duration it has seen.
#[derive(Debug, Default)]
pub struct Factory {
    base: Option<Duration>,
}

impl Factory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The GCD of all registered periods/durations, `None` if the factory
    /// has created no timers yet.
    pub fn base_interval(&self) -> Option<Duration> {
        self.base
    }

    fn register(&mut self, span: Duration) {
        if span.is_zero() {
            return;
        }
        self.base = Some(match self.base {
            None => span,
            Some(base) => {
                let nanos = gcd(base.as_nanos(), span.as_nanos());
                Duration::from_nanos(nanos as u64)
            }
        });
    }
}

impl NodeFactory for Factory {
    fn create(&mut self, decl: &ir::Node) -> Result<Option<Box<dyn Node>>> {
        match decl.kind.as_str() {
            "interval" => {
                let node = Interval::from_config(decl)?;
                self.register(node.period);
                Ok(Some(Box::new(node)))
            }
            "wait" => {
                let node = Wait::from_config(decl)?;
                self.register(node.duration);
                Ok(Some(Box::new(node)))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_ir::ParamValue;

    const SECOND: Duration = Duration::from_secs(1);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn tick(elapsed: Duration, tolerance: Duration) -> Context {
        Context {
            elapsed,
            tolerance,
            ..Context::default()
        }
    }

    fn marked(ctx: &Context) -> bool {
        !ctx.commands.is_empty()
    }

    #[test]
    fn interval_first_tick_always_fires() {
        let mut node = Interval::new(SECOND);
        let mut ctx = tick(Duration::ZERO, Duration::ZERO);
        node.next(&mut ctx);
        assert!(marked(&ctx));
        assert_eq!(node.fired_at(), Some(Duration::ZERO));
    }

    #[test]
    fn interval_waits_out_its_period() {
        let mut node = Interval::new(SECOND);
        node.next(&mut tick(Duration::ZERO, Duration::ZERO));

        let mut ctx = tick(ms(500), Duration::ZERO);
        node.next(&mut ctx);
        assert!(!marked(&ctx));

        let mut ctx = tick(SECOND, Duration::ZERO);
        node.next(&mut ctx);
        assert!(marked(&ctx));
    }

    #[test]
    fn interval_fires_repeatedly() {
        let mut node = Interval::new(SECOND);
        for n in 1..=3u32 {
            let mut ctx = tick(SECOND * n, Duration::ZERO);
            node.next(&mut ctx);
            assert!(marked(&ctx), "tick {n} should fire");
            assert_eq!(node.fired_at(), Some(SECOND * n));
        }
    }

    #[test]
    fn interval_records_firing_timestamp() {
        let mut node = Interval::new(SECOND);
        node.next(&mut tick(SECOND * 5, Duration::ZERO));
        assert_eq!(node.fired_at(), Some(SECOND * 5));
    }

    #[test]
    fn interval_ignores_non_timer_cycles() {
        let mut node = Interval::new(SECOND);
        let mut ctx = tick(SECOND, Duration::ZERO);
        ctx.reason = RunReason::ChannelInput;
        node.next(&mut ctx);
        assert!(!marked(&ctx));
        assert!(!node.is_output_truthy(&OUTPUT_PARAM.into()));

        ctx.reason = RunReason::TimerTick;
        node.next(&mut ctx);
        assert!(marked(&ctx));
    }

    #[test]
    fn interval_truthy_only_after_firing() {
        let mut node = Interval::new(SECOND);
        assert!(!node.is_output_truthy(&OUTPUT_PARAM.into()));
        node.next(&mut tick(SECOND, Duration::ZERO));
        assert!(node.is_output_truthy(&OUTPUT_PARAM.into()));
        assert!(!node.is_output_truthy(&"nonexistent".into()));
    }

    #[test]
    fn interval_reset_allows_immediate_refire() {
        let mut node = Interval::new(SECOND);
        node.next(&mut tick(Duration::ZERO, Duration::ZERO));

        let mut ctx = tick(ms(500), Duration::ZERO);
        node.next(&mut ctx);
        assert!(!marked(&ctx));

        node.reset();
        assert!(!node.is_output_truthy(&OUTPUT_PARAM.into()));

        let mut ctx = tick(ms(600), Duration::ZERO);
        node.next(&mut ctx);
        assert!(marked(&ctx));
    }

    #[test]
    fn interval_fires_within_tolerance() {
        let mut node = Interval::new(SECOND);
        node.next(&mut tick(Duration::ZERO, Duration::ZERO));

        let mut ctx = tick(SECOND * 2 - ms(5), ms(50));
        node.next(&mut ctx);
        assert!(marked(&ctx));
    }

    #[test]
    fn interval_does_not_fire_too_early() {
        let mut node = Interval::new(SECOND);
        node.next(&mut tick(Duration::ZERO, Duration::ZERO));

        let mut ctx = tick(ms(900), ms(50));
        node.next(&mut ctx);
        assert!(!marked(&ctx));
    }

    #[test]
    fn wait_measures_from_first_tick_not_construction() {
        let mut node = Wait::new(SECOND);
        let mut ctx = tick(SECOND * 10, Duration::ZERO);
        node.next(&mut ctx);
        assert!(!marked(&ctx));

        let mut ctx = tick(SECOND * 11, Duration::ZERO);
        node.next(&mut ctx);
        assert!(marked(&ctx));
        assert_eq!(node.fired_at(), Some(SECOND * 11));
    }

    #[test]
    fn wait_fires_exactly_once() {
        let mut node = Wait::new(SECOND);
        node.next(&mut tick(Duration::ZERO, Duration::ZERO));

        let mut ctx = tick(SECOND, Duration::ZERO);
        node.next(&mut ctx);
        assert!(marked(&ctx));

        let mut ctx = tick(SECOND * 5, Duration::ZERO);
        node.next(&mut ctx);
        assert!(!marked(&ctx));
    }

    #[test]
    fn wait_reset_restarts_timing() {
        let mut node = Wait::new(SECOND);
        node.next(&mut tick(SECOND * 5, Duration::ZERO));

        node.reset();

        let mut ctx = tick(SECOND * 5 + ms(500), Duration::ZERO);
        node.next(&mut ctx);
        assert!(!marked(&ctx));

        let mut ctx = tick(SECOND * 6 + ms(500), Duration::ZERO);
        node.next(&mut ctx);
        assert!(marked(&ctx));
    }

    #[test]
    fn wait_ignores_non_timer_cycles() {
        let mut node = Wait::new(SECOND);

        // a channel-input cycle must not even start the timer
        let mut ctx = tick(Duration::ZERO, Duration::ZERO);
        ctx.reason = RunReason::ChannelInput;
        node.next(&mut ctx);

        let mut ctx = tick(ms(500), Duration::ZERO);
        node.next(&mut ctx);
        assert!(!marked(&ctx)); // timer started at 500ms, not 0

        let mut ctx = tick(SECOND, Duration::ZERO);
        node.next(&mut ctx);
        assert!(!marked(&ctx));

        let mut ctx = tick(SECOND + ms(500), Duration::ZERO);
        node.next(&mut ctx);
        assert!(marked(&ctx));
    }

    #[test]
    fn wait_fires_within_tolerance() {
        let mut node = Wait::new(SECOND);
        node.next(&mut tick(Duration::ZERO, Duration::ZERO));

        let mut ctx = tick(SECOND - ms(5), ms(50));
        node.next(&mut ctx);
        assert!(marked(&ctx));
    }

    #[test]
    fn wait_does_not_fire_too_early() {
        let mut node = Wait::new(SECOND);
        node.next(&mut tick(Duration::ZERO, Duration::ZERO));

        let mut ctx = tick(ms(900), ms(50));
        node.next(&mut ctx);
        assert!(!marked(&ctx));
    }

    #[test]
    fn tolerance_floor_covers_fine_bases() {
        assert_eq!(tolerance(Some(ms(2))), MIN_TOLERANCE);
    }

    #[test]
    fn tolerance_scales_with_coarse_bases() {
        assert_eq!(tolerance(Some(ms(100))), ms(50));
    }

    #[test]
    fn tolerance_without_timers_is_the_floor() {
        assert_eq!(tolerance(None), MIN_TOLERANCE);
    }

    fn timer_decl(kind: &str, param: &str, span: Duration) -> ir::Node {
        ir::Node::new(format!("{kind}_node"), kind)
            .with_config(param, ParamValue::I64(span.as_nanos() as i64))
    }

    #[test]
    fn factory_tracks_gcd_of_registered_timers() {
        let mut factory = Factory::new();
        factory
            .create(&timer_decl("interval", "period", ms(600)))
            .unwrap()
            .expect("interval node");
        factory
            .create(&timer_decl("wait", "duration", ms(400)))
            .unwrap()
            .expect("wait node");
        assert_eq!(factory.base_interval(), Some(ms(200)));
    }

    #[test]
    fn factory_declines_other_node_types() {
        let mut factory = Factory::new();
        let result = factory.create(&ir::Node::new("adder", "add")).unwrap();
        assert!(result.is_none());
        assert_eq!(factory.base_interval(), None);
    }

    #[test]
    fn factory_requires_timer_config() {
        let mut factory = Factory::new();
        let result = factory.create(&ir::Node::new("timer", "interval"));
        assert!(matches!(result, Err(Error::MissingConfig { .. })));
    }
}
