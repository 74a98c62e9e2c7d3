//! Built-in modules.
//!
//! A host without user extensions is still usable: these modules back the
//! demo configuration and the test suites. `SwitchBoard` and `DummyCamera`
//! stand in for hardware, `CounterLogic` and `ScanLogic` for measurement
//! logic driving them through connectors.

use serde_yaml::Mapping;
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::meta::{ConfigOption, Connector, MissingPolicy, ModuleDecl, StatusVar};
use crate::module::{Module, ModuleContext};
use crate::registry::{ModuleClass, ModuleRegistry};
use crate::yaml::{f64_array, Value};

fn positive_number(value: &Value) -> bool {
    value.as_f64().map(|v| v > 0.0) == Some(true)
}

fn two_positive_ints(value: Value) -> Result<Value, String> {
    let seq = value.as_sequence().ok_or("expected a two-element sequence")?;
    if seq.len() != 2 {
        return Err(format!("expected 2 elements, got {}", seq.len()));
    }
    for item in seq {
        if item.as_u64().filter(|v| *v > 0).is_none() {
            return Err("resolution components must be positive integers".to_string());
        }
    }
    Ok(value)
}

/// Simulated digital switch bank. Channel states persist across restarts.
#[derive(Default)]
pub struct SwitchBoard;

impl SwitchBoard {
    pub fn declaration() -> ModuleDecl {
        ModuleDecl::new()
            .interface("switch")
            .option(ConfigOption::with_default("channels", 8).checker(positive_number))
            .status_var(StatusVar::new("states", Value::Mapping(Mapping::new())))
    }

    fn states(ctx: &ModuleContext) -> Result<Mapping> {
        match ctx.status("states")? {
            Value::Mapping(states) => Ok(states),
            _ => Ok(Mapping::new()),
        }
    }
}

impl Module for SwitchBoard {
    fn on_activate(&mut self, ctx: &mut ModuleContext) -> Result<()> {
        let channels = ctx.option_i64("channels")?;
        info!(module = ctx.name(), channels, "switch board ready");
        Ok(())
    }

    fn on_deactivate(&mut self, ctx: &mut ModuleContext) -> Result<()> {
        debug!(module = ctx.name(), "switch board shut down");
        Ok(())
    }

    fn call(&mut self, ctx: &mut ModuleContext, method: &str, args: &[Value]) -> Result<Value> {
        match method {
            "set_state" => {
                let name = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| bad_args(ctx, "set_state expects (name, bool)"))?
                    .to_string();
                let on = args
                    .get(1)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| bad_args(ctx, "set_state expects (name, bool)"))?;
                let mut states = Self::states(ctx)?;
                states.insert(Value::String(name), Value::Bool(on));
                ctx.set_status("states", Value::Mapping(states))?;
                Ok(Value::Null)
            }
            "get_state" => {
                let name = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| bad_args(ctx, "get_state expects (name)"))?;
                let states = Self::states(ctx)?;
                Ok(states
                    .get(&Value::String(name.to_string()))
                    .cloned()
                    .unwrap_or(Value::Bool(false)))
            }
            other => Err(CoreError::UnknownMember {
                module: ctx.name().to_string(),
                kind: "method",
                name: other.to_string(),
            }),
        }
    }
}

/// Simulated frame camera producing dense f64 frames, the kind of payload
/// the remote fast path exists for.
#[derive(Default)]
pub struct DummyCamera;

impl DummyCamera {
    pub fn declaration() -> ModuleDecl {
        ModuleDecl::new()
            .interface("camera")
            .option(
                ConfigOption::with_default("exposure_ms", 10.0)
                    .missing(MissingPolicy::Info)
                    .checker(positive_number),
            )
            .option(
                ConfigOption::with_default(
                    "resolution",
                    Value::Sequence(vec![Value::from(64), Value::from(64)]),
                )
                .constructor(two_positive_ints),
            )
            .status_var(StatusVar::new("frames_acquired", 0))
    }

    fn resolution(ctx: &ModuleContext) -> Result<(usize, usize)> {
        let value = ctx.option("resolution")?;
        let bad = || CoreError::Descriptor {
            module: ctx.name().to_string(),
            problem: "option 'resolution' is not a [width, height] pair".to_string(),
        };
        let seq = value.as_sequence().ok_or_else(bad)?;
        let width = seq.first().and_then(Value::as_u64).ok_or_else(bad)?;
        let height = seq.get(1).and_then(Value::as_u64).ok_or_else(bad)?;
        Ok((width as usize, height as usize))
    }
}

impl Module for DummyCamera {
    fn on_activate(&mut self, ctx: &mut ModuleContext) -> Result<()> {
        let (width, height) = Self::resolution(ctx)?;
        info!(module = ctx.name(), width, height, "camera ready");
        Ok(())
    }

    fn on_deactivate(&mut self, ctx: &mut ModuleContext) -> Result<()> {
        debug!(module = ctx.name(), "camera shut down");
        Ok(())
    }

    fn call(&mut self, ctx: &mut ModuleContext, method: &str, _args: &[Value]) -> Result<Value> {
        match method {
            "acquire_frame" => {
                let (width, height) = Self::resolution(ctx)?;
                let count = ctx.status("frames_acquired")?.as_u64().unwrap_or(0);
                // Deterministic ramp so tests can assert on content.
                let pixels: Vec<f64> = (0..width * height)
                    .map(|i| (i as f64 + count as f64) % 255.0)
                    .collect();
                ctx.set_status("frames_acquired", Value::from(count + 1))?;
                Ok(f64_array(&pixels))
            }
            "frame_size" => {
                let (width, height) = Self::resolution(ctx)?;
                Ok(Value::Sequence(vec![
                    Value::from(width as u64),
                    Value::from(height as u64),
                ]))
            }
            other => Err(CoreError::UnknownMember {
                module: ctx.name().to_string(),
                kind: "method",
                name: other.to_string(),
            }),
        }
    }
}

/// Measurement logic keeping a persistent counter and gating itself through
/// a switch channel on its required hardware connector.
#[derive(Default)]
pub struct CounterLogic;

impl CounterLogic {
    const ENABLE_CHANNEL: &'static str = "counter_enable";

    pub fn declaration() -> ModuleDecl {
        ModuleDecl::new()
            .interface("counter")
            .connector(Connector::new("switch", "switch"))
            .option(ConfigOption::with_default("step", 1).checker(positive_number))
            .status_var(StatusVar::new("count", 0))
    }
}

impl Module for CounterLogic {
    fn on_activate(&mut self, ctx: &mut ModuleContext) -> Result<()> {
        // The connector target is idle before this hook runs; claim our
        // enable line on it.
        ctx.connector("switch")?.call(
            "set_state",
            vec![Value::from(Self::ENABLE_CHANNEL), Value::Bool(true)],
        )?;
        info!(module = ctx.name(), "counter enabled");
        Ok(())
    }

    fn on_deactivate(&mut self, ctx: &mut ModuleContext) -> Result<()> {
        ctx.connector("switch")?.call(
            "set_state",
            vec![Value::from(Self::ENABLE_CHANNEL), Value::Bool(false)],
        )?;
        Ok(())
    }

    fn call(&mut self, ctx: &mut ModuleContext, method: &str, args: &[Value]) -> Result<Value> {
        match method {
            "increment" => {
                let times = args.first().and_then(Value::as_i64).unwrap_or(1);
                let step = ctx.option_i64("step")?;
                let count = ctx.status("count")?.as_i64().unwrap_or(0) + times * step;
                ctx.set_status("count", Value::from(count))?;
                Ok(Value::from(count))
            }
            "reset" => {
                ctx.set_status("count", Value::from(0))?;
                Ok(Value::Null)
            }
            "count" => ctx.status("count"),
            other => Err(CoreError::UnknownMember {
                module: ctx.name().to_string(),
                kind: "method",
                name: other.to_string(),
            }),
        }
    }
}

/// Scan routine averaging frames from an optional camera. Locks itself for
/// the duration of a scan.
#[derive(Default)]
pub struct ScanLogic;

impl ScanLogic {
    pub fn declaration() -> ModuleDecl {
        ModuleDecl::new()
            .interface("scan")
            .connector(Connector::new("camera", "camera").optional())
            .option(ConfigOption::with_default("scan_points", 10).checker(positive_number))
            .status_var(StatusVar::new("last_scan_mean", Value::Null))
    }

    fn scan(ctx: &mut ModuleContext) -> Result<f64> {
        let points = ctx.option_i64("scan_points")?;
        let mut total = 0.0;
        let mut samples = 0usize;
        for _ in 0..points {
            let frame = ctx.connector("camera")?.call("acquire_frame", Vec::new())?;
            let pixels = crate::yaml::as_f64_array(&frame).ok_or_else(|| CoreError::Descriptor {
                module: ctx.name().to_string(),
                problem: "camera returned a non-numeric frame".to_string(),
            })?;
            total += pixels.iter().sum::<f64>();
            samples += pixels.len();
        }
        if samples == 0 {
            return Ok(0.0);
        }
        Ok(total / samples as f64)
    }
}

impl Module for ScanLogic {
    fn on_activate(&mut self, ctx: &mut ModuleContext) -> Result<()> {
        info!(module = ctx.name(), "scan logic ready");
        Ok(())
    }

    fn on_deactivate(&mut self, ctx: &mut ModuleContext) -> Result<()> {
        Ok(())
    }

    fn call(&mut self, ctx: &mut ModuleContext, method: &str, _args: &[Value]) -> Result<Value> {
        match method {
            "run_scan" => {
                ctx.lock()?;
                let result = Self::scan(ctx);
                ctx.unlock()?;
                let mean = result?;
                ctx.set_status("last_scan_mean", Value::from(mean))?;
                Ok(Value::from(mean))
            }
            "last_scan_mean" => ctx.status("last_scan_mean"),
            other => Err(CoreError::UnknownMember {
                module: ctx.name().to_string(),
                kind: "method",
                name: other.to_string(),
            }),
        }
    }
}

fn bad_args(ctx: &ModuleContext, problem: &str) -> CoreError {
    CoreError::Descriptor {
        module: ctx.name().to_string(),
        problem: problem.to_string(),
    }
}

/// Registry with every built-in module class registered under its locator.
pub fn default_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register(
        "labhost.hardware.switchboard.SwitchBoard",
        ModuleClass::new(SwitchBoard::declaration(), || Box::<SwitchBoard>::default()),
    );
    registry.register(
        "labhost.hardware.dummy_camera.DummyCamera",
        ModuleClass::new(DummyCamera::declaration(), || Box::<DummyCamera>::default()),
    );
    registry.register(
        "labhost.logic.counter.CounterLogic",
        ModuleClass::new(CounterLogic::declaration(), || Box::<CounterLogic>::default()),
    );
    registry.register(
        "labhost.logic.scan.ScanLogic",
        ModuleClass::new(ScanLogic::declaration(), || Box::<ScanLogic>::default()),
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_resolves_builtins() {
        let registry = default_registry();
        for locator in [
            "labhost.hardware.switchboard.SwitchBoard",
            "labhost.hardware.dummy_camera.DummyCamera",
            "labhost.logic.counter.CounterLogic",
            "labhost.logic.scan.ScanLogic",
        ] {
            assert!(registry.contains(locator), "missing {locator}");
        }
    }

    #[test]
    fn counter_declares_required_switch_connector() {
        let decl = CounterLogic::declaration();
        let connector = decl.find_connector("switch").unwrap();
        assert!(!connector.optional);
        assert_eq!(connector.interface, "switch");
    }

    #[test]
    fn scan_camera_connector_is_optional() {
        let decl = ScanLogic::declaration();
        assert!(decl.find_connector("camera").unwrap().optional);
    }

    #[test]
    fn resolution_constructor_rejects_bad_shapes() {
        assert!(two_positive_ints(Value::Sequence(vec![Value::from(64)])).is_err());
        assert!(two_positive_ints(Value::from("64x64")).is_err());
        assert!(two_positive_ints(Value::Sequence(vec![Value::from(0), Value::from(4)])).is_err());
        assert!(
            two_positive_ints(Value::Sequence(vec![Value::from(32), Value::from(32)])).is_ok()
        );
    }
}
