//! Event router between rendered widgets and the live device.
//!
//! Output widgets get one outport subscription each, writing formatted
//! display content into the shared [`WidgetBoard`]. Input widgets hold a
//! handle to their parameter and turn gestures into clamped writes.
//! Dropping a binding drops its subscription, so [`EventRouter::detach`]
//! guarantees nothing from the old device reaches the board afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::device::{Device, DeviceError, MessageFilter, Parameter, Subscription};
use crate::error::{PatchGridError, Result};
use crate::layout::model::LayoutEntry;
use crate::logging::{LogLevel, Logger, ROUTER_TARGET, event_with_fields, json_kv, json_str};
use crate::metrics::SessionMetrics;
use crate::registry::SharedBoard;
use crate::widget::{
    DialGeometry, DisplayKind, DisplayValue, DragAxis, DragGesture, Interaction, WidgetRegistry,
};

pub const DEFAULT_BUTTON_RESET: Duration = Duration::from_millis(40);

struct OutputBinding {
    tag: String,
    _subscription: Subscription,
}

struct InputBinding {
    parameter: Arc<Parameter>,
    interaction: Interaction,
    drag: Option<DragGesture>,
}

struct PendingReset {
    widget_id: String,
    parameter: Arc<Parameter>,
    due: Instant,
}

/// Summary of [`EventRouter::bind_layout`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindReport {
    pub inputs: usize,
    pub outputs: usize,
    /// Widgets whose control the device does not declare.
    pub inert: Vec<String>,
}

pub struct EventRouter {
    board: SharedBoard,
    device: Option<Arc<Device>>,
    outputs: HashMap<String, OutputBinding>,
    inputs: HashMap<String, InputBinding>,
    resets: Vec<PendingReset>,
    button_reset: Duration,
    dial: DialGeometry,
    interactive: bool,
    logger: Option<Logger>,
    metrics: Option<Arc<Mutex<SessionMetrics>>>,
}

impl EventRouter {
    pub fn new(board: SharedBoard) -> Self {
        Self {
            board,
            device: None,
            outputs: HashMap::new(),
            inputs: HashMap::new(),
            resets: Vec::new(),
            button_reset: DEFAULT_BUTTON_RESET,
            dial: DialGeometry::default(),
            interactive: false,
            logger: None,
            metrics: None,
        }
    }

    pub fn with_button_reset(mut self, delay: Duration) -> Self {
        self.button_reset = delay;
        self
    }

    pub fn with_dial(mut self, dial: DialGeometry) -> Self {
        self.dial = dial;
        self
    }

    pub fn with_logger(mut self, logger: Option<Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<Mutex<SessionMetrics>>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn board(&self) -> &SharedBoard {
        &self.board
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    /// Gestures are ignored unless the grid is in interact mode.
    pub fn set_interactive(&mut self, interactive: bool) {
        self.interactive = interactive;
        if !interactive {
            for binding in self.inputs.values_mut() {
                binding.drag = None;
            }
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Route to `device`. Bindings for any previous device are torn down first.
    pub fn attach(&mut self, device: Arc<Device>) {
        self.detach();
        self.log(
            LogLevel::Debug,
            "router_attached",
            [json_kv("instance_id", device.instance_id())],
        );
        self.device = Some(device);
    }

    /// Drop every binding and pending reset. Safe to call repeatedly.
    pub fn detach(&mut self) {
        let released = self.outputs.len() + self.inputs.len();
        self.outputs.clear();
        self.inputs.clear();
        self.resets.clear();
        if let Some(device) = self.device.take() {
            self.log(
                LogLevel::Debug,
                "router_detached",
                [
                    json_kv("instance_id", device.instance_id()),
                    json_kv("bindings", released),
                ],
            );
        }
    }

    /// Drop bindings but keep the device, for a layout re-render.
    pub fn unbind_all(&mut self) {
        self.outputs.clear();
        self.inputs.clear();
        self.resets.clear();
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn bound_tag(&self, widget_id: &str) -> Option<&str> {
        self.outputs.get(widget_id).map(|binding| binding.tag.as_str())
    }

    /// Forward messages tagged exactly `outport_tag` into `widget_id`'s display.
    pub fn bind_output(&mut self, widget_id: &str, outport_tag: &str, kind: DisplayKind) -> Result<()> {
        let device = self.device.clone().ok_or(PatchGridError::NoDevice)?;
        let board = Arc::clone(&self.board);
        let metrics = self.metrics.clone();
        let target = widget_id.to_string();

        let subscription = device.messages().subscribe(
            MessageFilter::Tag(outport_tag.to_string()),
            move |message| {
                let display = DisplayValue::render(kind, &message.payload);
                let changed = match board.write() {
                    Ok(mut board) => board.apply_display(&target, display).unwrap_or(false),
                    Err(_) => false,
                };
                if let Some(metrics) = &metrics {
                    if let Ok(mut metrics) = metrics.lock() {
                        metrics.record_display_update(changed);
                    }
                }
            },
        );

        // Replacing an existing binding drops its subscription here.
        self.outputs.insert(
            widget_id.to_string(),
            OutputBinding {
                tag: outport_tag.to_string(),
                _subscription: subscription,
            },
        );
        Ok(())
    }

    /// Route `widget_id`'s gestures to writes on `parameter_id`.
    pub fn bind_input(
        &mut self,
        widget_id: &str,
        parameter_id: &str,
        interaction: Interaction,
    ) -> Result<()> {
        let device = self.device.as_ref().ok_or(PatchGridError::NoDevice)?;
        let parameter = device
            .parameter(parameter_id)
            .ok_or_else(|| DeviceError::UnknownParameter(parameter_id.to_string()))?;
        self.inputs.insert(
            widget_id.to_string(),
            InputBinding {
                parameter,
                interaction,
                drag: None,
            },
        );
        Ok(())
    }

    /// Bind every entry of a rendered layout. Entries whose control the
    /// device lacks stay rendered but are marked inert on the board.
    pub fn bind_layout(&mut self, entries: &[LayoutEntry]) -> Result<BindReport> {
        let device = self.device.clone().ok_or(PatchGridError::NoDevice)?;
        self.unbind_all();

        let mut report = BindReport::default();
        for entry in entries {
            let control = &entry.association.control_id;
            let behavior = WidgetRegistry::lookup(entry.widget_type());
            let bound = match behavior.interaction {
                Interaction::Display(kind) => {
                    if device.outports().iter().any(|tag| tag == control) {
                        self.bind_output(&entry.widget_id, control, kind)?;
                        report.outputs += 1;
                        true
                    } else {
                        false
                    }
                }
                interaction => match self.bind_input(&entry.widget_id, control, interaction) {
                    Ok(()) => {
                        report.inputs += 1;
                        true
                    }
                    Err(PatchGridError::Device(DeviceError::UnknownParameter(_))) => false,
                    Err(err) => return Err(err),
                },
            };
            if !bound {
                report.inert.push(entry.widget_id.clone());
            }
            let marked = match self.board.write() {
                Ok(mut board) => board.set_inert(&entry.widget_id, !bound),
                Err(_) => Ok(()),
            };
            if let Err(err) = marked {
                self.log(
                    LogLevel::Debug,
                    "board_out_of_sync",
                    [
                        json_str("widget_id", entry.widget_id.as_str()),
                        json_str("error", err.to_string()),
                    ],
                );
            }
        }

        self.log(
            LogLevel::Info,
            "layout_bound",
            [
                json_kv("inputs", report.inputs),
                json_kv("outputs", report.outputs),
                json_kv("inert", json!(report.inert)),
            ],
        );
        Ok(report)
    }

    /// Button or switch press. Returns the value written, or `None` when
    /// gestures are currently ignored.
    pub fn press(&mut self, widget_id: &str, now: Instant) -> Result<Option<f64>> {
        if !self.interactive {
            return Ok(None);
        }
        let binding = self.input(widget_id)?;
        let parameter = Arc::clone(&binding.parameter);
        let interaction = binding.interaction;
        let written = match interaction {
            Interaction::Momentary => {
                let value = parameter.set_value(parameter.max());
                self.resets.retain(|reset| reset.widget_id != widget_id);
                self.resets.push(PendingReset {
                    widget_id: widget_id.to_string(),
                    parameter: Arc::clone(&parameter),
                    due: now + self.button_reset,
                });
                value
            }
            Interaction::Toggle => {
                let next = if parameter.value() == parameter.min() {
                    parameter.max()
                } else {
                    parameter.min()
                };
                parameter.set_value(next)
            }
            Interaction::Continuous(_) | Interaction::Display(_) => return Ok(None),
        };
        self.record_write(widget_id, &parameter, written);
        Ok(Some(written))
    }

    /// Start a relative drag on a continuous widget. `extent_px` is the
    /// widget's size along its drag axis.
    pub fn begin_drag(&mut self, widget_id: &str, pointer: (f32, f32), extent_px: f32) -> Result<bool> {
        if !self.interactive {
            return Ok(false);
        }
        let binding = self.input_mut(widget_id)?;
        let Interaction::Continuous(axis) = binding.interaction else {
            return Ok(false);
        };
        let current = binding.parameter.normalized();
        binding.drag = Some(DragGesture::begin(axis, pointer, current, extent_px));
        Ok(true)
    }

    pub fn drag_to(&mut self, widget_id: &str, pointer: (f32, f32)) -> Result<Option<f64>> {
        if !self.interactive {
            return Ok(None);
        }
        let binding = self.input(widget_id)?;
        let Some(drag) = binding.drag else {
            return Ok(None);
        };
        let parameter = Arc::clone(&binding.parameter);
        let written = parameter.set_normalized(drag.value_at(pointer));
        self.record_write(widget_id, &parameter, written);
        Ok(Some(written))
    }

    pub fn end_drag(&mut self, widget_id: &str) -> Result<()> {
        self.input_mut(widget_id)?.drag = None;
        Ok(())
    }

    /// Direct normalized write, for hosts that compute the value themselves.
    pub fn set_normalized(&mut self, widget_id: &str, normalized: f64) -> Result<Option<f64>> {
        if !self.interactive {
            return Ok(None);
        }
        let binding = self.input(widget_id)?;
        if !matches!(binding.interaction, Interaction::Continuous(_)) {
            return Ok(None);
        }
        let parameter = Arc::clone(&binding.parameter);
        let written = parameter.set_normalized(normalized);
        self.record_write(widget_id, &parameter, written);
        Ok(Some(written))
    }

    /// Indicator angle for a dial, from its parameter's current value.
    pub fn dial_angle(&self, widget_id: &str) -> Option<f64> {
        let binding = self.inputs.get(widget_id)?;
        match binding.interaction {
            Interaction::Continuous(DragAxis::Rotary) => {
                Some(self.dial.angle_for(binding.parameter.normalized()))
            }
            _ => None,
        }
    }

    /// Write a dial's parameter from an absolute angle on its sweep.
    pub fn set_dial_angle(&mut self, widget_id: &str, angle: f64) -> Result<Option<f64>> {
        if !self.interactive {
            return Ok(None);
        }
        let binding = self.input(widget_id)?;
        if binding.interaction != Interaction::Continuous(DragAxis::Rotary) {
            return Ok(None);
        }
        let parameter = Arc::clone(&binding.parameter);
        let written = parameter.set_normalized(self.dial.value_for(angle));
        self.record_write(widget_id, &parameter, written);
        Ok(Some(written))
    }

    pub fn drag_axis(&self, widget_id: &str) -> Option<DragAxis> {
        match self.inputs.get(widget_id)?.interaction {
            Interaction::Continuous(axis) => Some(axis),
            _ => None,
        }
    }

    /// Apply button resets that are due. Returns how many ran.
    pub fn tick(&mut self, now: Instant) -> usize {
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.resets.drain(..).partition(|reset| reset.due <= now);
        self.resets = waiting;
        for reset in &due {
            let written = reset.parameter.set_value(reset.parameter.min());
            self.record_write(&reset.widget_id, &reset.parameter, written);
        }
        due.len()
    }

    pub fn next_reset_due(&self) -> Option<Instant> {
        self.resets.iter().map(|reset| reset.due).min()
    }

    fn input(&self, widget_id: &str) -> Result<&InputBinding> {
        self.inputs
            .get(widget_id)
            .ok_or_else(|| PatchGridError::WidgetNotFound(widget_id.to_string()))
    }

    fn input_mut(&mut self, widget_id: &str) -> Result<&mut InputBinding> {
        self.inputs
            .get_mut(widget_id)
            .ok_or_else(|| PatchGridError::WidgetNotFound(widget_id.to_string()))
    }

    fn record_write(&self, widget_id: &str, parameter: &Parameter, value: f64) {
        if let Some(metrics) = &self.metrics {
            if let Ok(mut metrics) = metrics.lock() {
                metrics.record_parameter_write();
            }
        }
        self.log(
            LogLevel::Trace,
            "parameter_write",
            [
                json_str("widget_id", widget_id),
                json_str("parameter", parameter.id()),
                json_kv("value", value),
            ],
        );
    }

    fn log<I>(&self, level: LogLevel, message: &str, fields: I)
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        if let Some(logger) = &self.logger {
            let _ = logger.emit(&event_with_fields(level, ROUTER_TARGET, message, fields));
        }
    }
}

impl Drop for EventRouter {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HeadlessDeviceFactory, OutportMessage, OutportSpec, ParameterSpec, PatchDescription};
    use crate::layout::model::{WidgetAssociation, WidgetType};
    use crate::logging::MemorySink;
    use crate::registry::WidgetBoard;

    fn device() -> Arc<Device> {
        let description = PatchDescription::new(
            vec![
                ParameterSpec::new("trig", 0.0, 1.0),
                ParameterSpec::new("gate", 0.0, 1.0),
                ParameterSpec::new("cutoff", 20.0, 220.0),
                ParameterSpec::new("other", 0.0, 1.0).with_initial(0.25),
            ],
            vec![
                OutportSpec { tag: "foo".into() },
                OutportSpec { tag: "bar".into() },
            ],
        );
        Arc::new(HeadlessDeviceFactory::new().build("p1", &description))
    }

    fn entries() -> Vec<LayoutEntry> {
        vec![
            LayoutEntry::floating("button1", WidgetAssociation::new("trig", WidgetType::Button)),
            LayoutEntry::floating("switch2", WidgetAssociation::new("gate", WidgetType::Switch)),
            LayoutEntry::floating("vslider3", WidgetAssociation::new("cutoff", WidgetType::VSlider)),
            LayoutEntry::floating("numberBox4", WidgetAssociation::new("foo", WidgetType::NumberBox)),
            LayoutEntry::floating("light5", WidgetAssociation::new("foo", WidgetType::Light)),
            LayoutEntry::floating("dial6", WidgetAssociation::new("renamed", WidgetType::Dial)),
            LayoutEntry::floating("dial7", WidgetAssociation::new("other", WidgetType::Dial)),
        ]
    }

    fn bound_router() -> (EventRouter, Arc<Device>) {
        let board = WidgetBoard::shared();
        board.write().unwrap().sync_entries(&entries());
        let mut router = EventRouter::new(board);
        let device = device();
        router.attach(Arc::clone(&device));
        router.bind_layout(&entries()).unwrap();
        router.set_interactive(true);
        (router, device)
    }

    fn display(router: &EventRouter, widget_id: &str) -> DisplayValue {
        router
            .board()
            .read()
            .unwrap()
            .display_of(widget_id)
            .cloned()
            .unwrap()
    }

    #[test]
    fn bind_layout_marks_missing_controls_inert() {
        let board = WidgetBoard::shared();
        board.write().unwrap().sync_entries(&entries());
        let mut router = EventRouter::new(Arc::clone(&board));
        router.attach(device());
        let report = router.bind_layout(&entries()).unwrap();
        assert_eq!(report.inputs, 4);
        assert_eq!(report.outputs, 2);
        assert_eq!(report.inert, vec!["dial6".to_string()]);
        assert!(board.read().unwrap().get("dial6").unwrap().inert);
    }

    #[test]
    fn button_press_triggers_then_resets() {
        let (mut router, device) = bound_router();
        let trig = device.parameter("trig").unwrap();
        let other = device.parameter("other").unwrap();
        let start = Instant::now();

        assert_eq!(router.press("button1", start).unwrap(), Some(1.0));
        assert_eq!(trig.value(), 1.0);
        assert_eq!(router.tick(start + Duration::from_millis(39)), 0);
        assert_eq!(trig.value(), 1.0);
        assert_eq!(router.tick(start + Duration::from_millis(40)), 1);
        assert_eq!(trig.value(), 0.0);
        assert_eq!(other.value(), 0.25);
        assert!(router.next_reset_due().is_none());
    }

    #[test]
    fn second_press_rearms_reset() {
        let (mut router, device) = bound_router();
        let trig = device.parameter("trig").unwrap();
        let start = Instant::now();
        router.press("button1", start).unwrap();
        router.press("button1", start + Duration::from_millis(30)).unwrap();
        assert_eq!(router.tick(start + Duration::from_millis(45)), 0);
        assert_eq!(trig.value(), 1.0);
        assert_eq!(router.tick(start + Duration::from_millis(70)), 1);
        assert_eq!(trig.value(), 0.0);
    }

    #[test]
    fn switch_toggles_between_extremes() {
        let (mut router, device) = bound_router();
        let now = Instant::now();
        assert_eq!(router.press("switch2", now).unwrap(), Some(1.0));
        assert_eq!(router.press("switch2", now).unwrap(), Some(0.0));
        assert_eq!(device.parameter("gate").unwrap().value(), 0.0);
    }

    #[test]
    fn slider_drag_maps_into_parameter_range() {
        let (mut router, device) = bound_router();
        assert!(router.begin_drag("vslider3", (0.0, 300.0), 300.0).unwrap());
        assert_eq!(router.drag_to("vslider3", (0.0, 150.0)).unwrap(), Some(120.0));
        assert_eq!(router.drag_to("vslider3", (0.0, -900.0)).unwrap(), Some(220.0));
        router.end_drag("vslider3").unwrap();
        assert_eq!(router.drag_to("vslider3", (0.0, 0.0)).unwrap(), None);
        assert_eq!(device.parameter("cutoff").unwrap().value(), 220.0);
        assert_eq!(router.set_normalized("vslider3", 0.0).unwrap(), Some(20.0));
    }

    #[test]
    fn dial_angle_tracks_parameter() {
        let (mut router, device) = bound_router();
        assert_eq!(router.dial_angle("dial7"), Some(90.0));
        assert_eq!(router.dial_angle("vslider3"), None);
        assert_eq!(router.set_dial_angle("dial7", 270.0).unwrap(), Some(0.75));
        assert_eq!(device.parameter("other").unwrap().value(), 0.75);

        let mut narrow = EventRouter::new(WidgetBoard::shared()).with_dial(DialGeometry::new(270.0));
        narrow.attach(Arc::clone(&device));
        narrow.bind_input("dial7", "other", Interaction::Continuous(DragAxis::Rotary)).unwrap();
        assert_eq!(narrow.dial_angle("dial7"), Some(247.5));
    }

    #[test]
    fn unsynced_board_entries_are_logged() {
        let sink = MemorySink::new();
        let board = WidgetBoard::shared();
        board.write().unwrap().sync_entries(&entries()[..2]);
        let mut router = EventRouter::new(Arc::clone(&board)).with_logger(Some(Logger::new(sink.clone())));
        router.attach(device());
        let report = router.bind_layout(&entries()).unwrap();
        assert_eq!(report.inputs, 4);

        let unsynced: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|event| event.message == "board_out_of_sync")
            .filter_map(|event| event.field("widget_id").cloned())
            .collect();
        assert_eq!(unsynced.len(), entries().len() - 2);
        assert_eq!(unsynced[0], json!("vslider3"));
    }

    #[test]
    fn gestures_are_ignored_in_edit_mode() {
        let (mut router, device) = bound_router();
        router.set_interactive(false);
        assert_eq!(router.press("button1", Instant::now()).unwrap(), None);
        assert!(!router.begin_drag("vslider3", (0.0, 0.0), 100.0).unwrap());
        assert_eq!(device.parameter("trig").unwrap().value(), 0.0);
    }

    #[test]
    fn outport_messages_reach_only_matching_widgets() {
        let (router, device) = bound_router();
        device.emit(OutportMessage::new("foo", 1500.0));
        assert_eq!(display(&router, "numberBox4"), DisplayValue::Text("2k+".into()));
        assert_eq!(
            display(&router, "light5"),
            DisplayValue::Light(crate::widget::LightLevel::High)
        );

        router.board().write().unwrap().take_dirty();
        assert_eq!(device.emit(OutportMessage::new("bar", 1.0)), 0);
        assert!(!router.board().read().unwrap().has_dirty());
    }

    #[test]
    fn detach_unsubscribes_old_device() {
        let (mut router, device) = bound_router();
        assert_eq!(device.messages().subscriber_count(), 2);
        router.attach(super::tests::device());
        assert_eq!(device.messages().subscriber_count(), 0);
        assert_eq!(device.emit(OutportMessage::new("foo", 3.0)), 0);
        assert_eq!(display(&router, "numberBox4"), DisplayValue::Empty);
    }

    #[test]
    fn unknown_widget_gesture_is_an_error() {
        let (mut router, _device) = bound_router();
        assert!(matches!(
            router.press("nope", Instant::now()),
            Err(PatchGridError::WidgetNotFound(_))
        ));
    }

    #[test]
    fn binding_without_device_fails() {
        let mut router = EventRouter::new(WidgetBoard::shared());
        assert!(matches!(
            router.bind_output("numberBox1", "foo", DisplayKind::Number),
            Err(PatchGridError::NoDevice)
        ));
    }
}
