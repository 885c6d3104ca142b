//! Editor session: the application context tying the grid, the resolver,
//! the router and the live device together for one selected patch.
//!
//! Async work is split in three steps so results can never race the user:
//! `begin_*` mints a ticket synchronously, the returned handle's `run`
//! performs the I/O without borrowing the session, and `apply_*`/`finish_*`
//! checks the ticket before touching any state. Switching patches bumps the
//! session generation, which turns every outstanding ticket stale.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::audit::{SessionAuditEventBuilder, SessionAuditStage};
use super::{AudioReadiness, Notification, SessionConfig};
use crate::device::{AudioOutput, Device, DeviceError, DeviceFactory, PatchDescription};
use crate::error::{PatchGridError, Result};
use crate::geometry::GridRect;
use crate::layout::grid::{GridEngine, GridMode, PointerRoute};
use crate::layout::model::{GridGeometry, Layout, clamp_columns};
use crate::logging::{
    GRID_TARGET, LogLevel, SESSION_TARGET, event_with_fields, json_kv, json_str,
};
use crate::metrics::SessionMetrics;
use crate::persistence::{ApiError, LayoutApi, LoadedLayout, UpdateLayoutRequest};
use crate::registry::{SharedBoard, WidgetBoard};
use crate::resolver::{
    ControlSet, UiAssociations, reconcile, resolve_columns, skipped_associations,
};
use crate::router::EventRouter;
use crate::widget::DragAxis;

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Identifies one layout load. Stale once the patch changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutTicket {
    patch_id: String,
    generation: u64,
}

impl LayoutTicket {
    pub fn patch_id(&self) -> &str {
        &self.patch_id
    }
}

/// Everything a load brings back for one patch.
#[derive(Debug, Clone)]
pub struct LoadedPatch {
    /// `None` when the patch has no stored layout yet.
    pub layout: Option<LoadedLayout>,
    pub associations: UiAssociations,
    /// Controls declared by the patch description, when it could be read.
    pub controls: Option<ControlSet>,
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub ticket: LayoutTicket,
    pub result: ApiResult<LoadedPatch>,
}

/// Pending layout load. Dropping it abandons the load.
pub struct LayoutLoad<A> {
    ticket: LayoutTicket,
    api: Arc<A>,
}

impl<A: LayoutApi> LayoutLoad<A> {
    pub fn ticket(&self) -> &LayoutTicket {
        &self.ticket
    }

    pub async fn run(self) -> LoadOutcome {
        let result = fetch_patch_layout(self.api.as_ref(), &self.ticket.patch_id).await;
        LoadOutcome {
            ticket: self.ticket,
            result,
        }
    }
}

async fn fetch_patch_layout<A: LayoutApi>(api: &A, patch_id: &str) -> ApiResult<LoadedPatch> {
    let layout = api
        .fetch_layout(patch_id)
        .await?
        .map(|document| document.decode());
    let associations = api
        .fetch_ui_associations(patch_id)
        .await?
        .unwrap_or_default();
    // An unreadable description only costs the control set; the session
    // then infers controls from the associations.
    let controls = api
        .fetch_patch(patch_id)
        .await
        .ok()
        .flatten()
        .and_then(|document| PatchDescription::from_json(document).ok())
        .map(|description| ControlSet::from_description(&description));
    Ok(LoadedPatch {
        layout,
        associations,
        controls,
    })
}

/// Identifies one device setup attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupTicket {
    id: u64,
    patch_id: String,
    generation: u64,
}

impl SetupTicket {
    pub fn patch_id(&self) -> &str {
        &self.patch_id
    }
}

struct InFlightSetup {
    ticket: SetupTicket,
    token: CancellationToken,
}

#[derive(Debug)]
pub struct SetupOutcome {
    pub ticket: SetupTicket,
    pub result: std::result::Result<Device, DeviceError>,
}

/// Pending device construction: fetch the patch description, then build.
/// Resolves early with [`DeviceError::Cancelled`] when the session moves on.
pub struct DeviceSetup<A, F> {
    ticket: SetupTicket,
    token: CancellationToken,
    api: Arc<A>,
    factory: Arc<F>,
}

impl<A: LayoutApi, F: DeviceFactory> DeviceSetup<A, F> {
    pub fn ticket(&self) -> &SetupTicket {
        &self.ticket
    }

    pub async fn run(self) -> SetupOutcome {
        let DeviceSetup {
            ticket,
            token,
            api,
            factory,
        } = self;
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(DeviceError::Cancelled),
            built = construct_device(api.as_ref(), factory.as_ref(), &ticket.patch_id) => built,
        };
        SetupOutcome { ticket, result }
    }
}

async fn construct_device<A: LayoutApi, F: DeviceFactory>(
    api: &A,
    factory: &F,
    patch_id: &str,
) -> std::result::Result<Device, DeviceError> {
    let document = api
        .fetch_patch(patch_id)
        .await?
        .ok_or_else(|| DeviceError::PatchNotFound(patch_id.to_string()))?;
    let description = PatchDescription::from_json(document)?;
    factory.create_device(patch_id, description).await
}

#[derive(Debug)]
pub struct SaveOutcome {
    pub patch_id: String,
    pub num_columns: u8,
    pub result: ApiResult<()>,
}

/// Pending full-replace save of the current placement.
pub struct LayoutSave<A> {
    patch_id: String,
    request: UpdateLayoutRequest,
    api: Arc<A>,
}

impl<A: LayoutApi> LayoutSave<A> {
    pub fn request(&self) -> &UpdateLayoutRequest {
        &self.request
    }

    pub async fn run(self) -> SaveOutcome {
        let result = self.api.update_layout(&self.patch_id, &self.request).await;
        SaveOutcome {
            patch_id: self.patch_id,
            num_columns: self.request.num_columns,
            result,
        }
    }
}

/// What one [`EditorSession::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SessionTick {
    pub resets: usize,
    pub reflow: Option<GridGeometry>,
    pub metrics_emitted: bool,
}

/// Seed written into the patch's seed parameter on setup.
pub fn random_seed_value(unix_ms: u128) -> f64 {
    (unix_ms % 1000) as f64 / 1000.0
}

pub struct EditorSession<A, F> {
    api: Arc<A>,
    factory: Arc<F>,
    config: SessionConfig,
    grid: GridEngine,
    board: SharedBoard,
    router: EventRouter,
    output: AudioOutput,
    readiness: AudioReadiness,
    patch_id: Option<String>,
    generation: u64,
    next_setup_id: u64,
    setup: Option<InFlightSetup>,
    device: Option<Arc<Device>>,
    pending_columns: Option<u8>,
    persisted_columns: Option<u8>,
    show_labels: bool,
    inert: Vec<String>,
    active_drag: Option<String>,
    started: Instant,
    last_metrics_emit: Option<Instant>,
}

impl<A: LayoutApi, F: DeviceFactory> EditorSession<A, F> {
    pub fn new(api: Arc<A>, factory: Arc<F>, mut config: SessionConfig) -> Result<Self> {
        let level = config.settings.log_level;
        config.logger = config.logger.map(|logger| logger.with_min_level(level));
        let settings = &config.settings;
        let grid = GridEngine::initialize(settings.default_columns as u32, settings.container_width)?
            .with_debounce(settings.reflow_debounce());
        let board = WidgetBoard::shared();
        let router = EventRouter::new(Arc::clone(&board))
            .with_button_reset(settings.button_reset())
            .with_logger(config.logger.clone())
            .with_metrics(config.metrics_handle());
        let now = Instant::now();

        Ok(Self {
            api,
            factory,
            config,
            grid,
            board,
            router,
            output: AudioOutput::new(),
            readiness: AudioReadiness::NotReady,
            patch_id: None,
            generation: 0,
            next_setup_id: 0,
            setup: None,
            device: None,
            pending_columns: None,
            persisted_columns: None,
            show_labels: true,
            inert: Vec::new(),
            active_drag: None,
            started: now,
            last_metrics_emit: Some(now),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn grid(&self) -> &GridEngine {
        &self.grid
    }

    pub fn board(&self) -> &SharedBoard {
        &self.board
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn output(&self) -> &AudioOutput {
        &self.output
    }

    pub fn readiness(&self) -> AudioReadiness {
        self.readiness
    }

    pub fn patch_id(&self) -> Option<&str> {
        self.patch_id.as_deref()
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    pub fn show_labels(&self) -> bool {
        self.show_labels
    }

    pub fn pending_columns(&self) -> Option<u8> {
        self.pending_columns
    }

    pub fn persisted_columns(&self) -> Option<u8> {
        self.persisted_columns
    }

    /// Rendered widgets whose control the patch no longer declares.
    pub fn inert_widgets(&self) -> &[String] {
        &self.inert
    }

    pub fn is_setup_in_flight(&self) -> bool {
        self.setup.is_some()
    }

    /// The user has interacted with the page; audio may start from now on.
    pub fn observe_first_gesture(&mut self) -> bool {
        let before = self.readiness;
        self.readiness = before.first_gesture();
        before != self.readiness
    }

    /// Switch to `patch_id`. Everything tied to the previous patch is torn
    /// down before this returns: the in-flight setup is cancelled, the
    /// router's subscriptions are dropped, the old device is disconnected
    /// and outstanding load tickets go stale.
    pub fn select_patch(&mut self, patch_id: impl Into<String>) {
        let patch_id = patch_id.into();
        self.cancel_setup();
        self.teardown_device();
        self.grid.remove_all();
        if let Ok(mut board) = self.board.write() {
            board.clear();
        }
        self.generation += 1;
        self.pending_columns = None;
        self.persisted_columns = None;
        self.show_labels = true;
        self.inert.clear();

        self.audit(
            SessionAuditStage::PatchSelected,
            [
                ("patch_id", json!(patch_id)),
                ("generation", json!(self.generation)),
            ],
        );
        self.log(
            LogLevel::Info,
            "patch_selected",
            [
                json_str("patch_id", patch_id.as_str()),
                json_kv("generation", self.generation),
            ],
        );
        self.patch_id = Some(patch_id);
    }

    pub fn begin_load(&self) -> Result<LayoutLoad<A>> {
        let patch_id = self
            .patch_id
            .clone()
            .ok_or(PatchGridError::NoPatchSelected)?;
        Ok(LayoutLoad {
            ticket: LayoutTicket {
                patch_id,
                generation: self.generation,
            },
            api: Arc::clone(&self.api),
        })
    }

    /// Place a load result on the grid, unless its ticket is stale.
    ///
    /// A failed load leaves the current placement alone and yields a
    /// notification. A missing layout falls back to the defaults silently.
    pub fn apply_layout(&mut self, outcome: LoadOutcome, now: Instant) -> Option<Notification> {
        let LoadOutcome { ticket, result } = outcome;
        if !self.is_current(&ticket) {
            self.with_metrics(SessionMetrics::record_stale_load);
            self.audit(
                SessionAuditStage::StaleLayoutDiscarded,
                [
                    ("patch_id", json!(ticket.patch_id)),
                    ("generation", json!(ticket.generation)),
                ],
            );
            self.log(
                LogLevel::Debug,
                "stale_layout_discarded",
                [json_str("patch_id", ticket.patch_id.as_str())],
            );
            return None;
        }

        let loaded = match result {
            Ok(loaded) => loaded,
            Err(err) => {
                self.log(
                    LogLevel::Warn,
                    "layout_load_failed",
                    [
                        json_str("patch_id", ticket.patch_id.as_str()),
                        json_str("error", err.to_string()),
                    ],
                );
                return Some(Notification::LoadFailed {
                    patch_id: ticket.patch_id,
                    message: err.to_string(),
                });
            }
        };

        let controls = match (&self.device, &loaded.controls) {
            (Some(device), _) => ControlSet::from_device(device),
            (None, Some(controls)) => controls.clone(),
            (None, None) => ControlSet::from_associations(&loaded.associations),
        };
        let (saved, stored_columns, show_labels) = match &loaded.layout {
            Some(layout) => {
                for dropped in &layout.parsed.dropped {
                    self.log(
                        LogLevel::Warn,
                        "layout_entry_dropped",
                        [
                            json_str("patch_id", ticket.patch_id.as_str()),
                            json_kv("index", *dropped),
                        ],
                    );
                }
                (Some(layout.entries()), layout.num_columns, layout.show_labels)
            }
            None => (None, None, true),
        };
        let reconciled = reconcile(saved, &loaded.associations, &controls);
        if !reconciled.from_saved {
            for skipped in skipped_associations(&loaded.associations, &controls) {
                self.log(
                    LogLevel::Debug,
                    "association_skipped",
                    [
                        json_str("control_id", skipped.control_id.as_str()),
                        json_str("reason", format!("{:?}", skipped.reason)),
                    ],
                );
            }
        }
        let columns = resolve_columns(self.pending_columns, stored_columns);

        self.persisted_columns = stored_columns;
        self.show_labels = show_labels;
        self.grid.remove_all();
        if let Err(err) = self.grid.set_columns(now, columns as u32) {
            self.log_to(
                GRID_TARGET,
                LogLevel::Warn,
                "columns_rejected",
                [json_str("error", err.to_string())],
            );
        }
        let width = self.grid.container_width();
        self.grid.reflow_now(width);
        for entry in &reconciled.entries {
            if let Err(err) = self.grid.add_widget(entry) {
                self.log_to(
                    GRID_TARGET,
                    LogLevel::Warn,
                    "layout_entry_skipped",
                    [
                        json_str("widget_id", entry.widget_id.as_str()),
                        json_str("error", err.to_string()),
                    ],
                );
            }
        }
        self.inert = reconciled.inert;
        self.render_board();

        self.with_metrics(SessionMetrics::record_layout_applied);
        self.audit(
            SessionAuditStage::LayoutApplied,
            [
                ("patch_id", json!(ticket.patch_id)),
                ("entries", json!(self.grid.len())),
                ("from_saved", json!(reconciled.from_saved)),
                ("columns", json!(columns)),
            ],
        );
        self.log(
            LogLevel::Info,
            "layout_applied",
            [
                json_str("patch_id", ticket.patch_id.as_str()),
                json_kv("entries", self.grid.len()),
                json_kv("from_saved", reconciled.from_saved),
                json_kv("inert", self.inert.len()),
            ],
        );
        None
    }

    /// Load and apply the selected patch's layout in one step.
    pub async fn load_layout(&mut self, now: Instant) -> Result<Option<Notification>> {
        let load = self.begin_load()?;
        let outcome = load.run().await;
        Ok(self.apply_layout(outcome, now))
    }

    /// Start building a device for the selected patch. Returns `None` when
    /// audio may not start yet, no patch is selected, or a setup is already
    /// in flight (that request is dropped, not queued).
    pub fn begin_device_setup(&mut self) -> Option<DeviceSetup<A, F>> {
        if let Some(in_flight) = &self.setup {
            let pending = in_flight.ticket.patch_id.clone();
            self.audit(
                SessionAuditStage::DeviceSetupDropped,
                [("in_flight", json!(pending))],
            );
            self.log(
                LogLevel::Debug,
                "device_setup_dropped",
                [json_str("in_flight", pending)],
            );
            return None;
        }
        if !self.readiness.can_start_audio() {
            self.log(LogLevel::Debug, "device_setup_not_ready", std::iter::empty());
            return None;
        }
        let patch_id = self.patch_id.clone()?;

        self.next_setup_id += 1;
        let ticket = SetupTicket {
            id: self.next_setup_id,
            patch_id,
            generation: self.generation,
        };
        let token = CancellationToken::new();
        self.setup = Some(InFlightSetup {
            ticket: ticket.clone(),
            token: token.clone(),
        });
        self.audit(
            SessionAuditStage::DeviceSetupStarted,
            [
                ("patch_id", json!(ticket.patch_id)),
                ("setup_id", json!(ticket.id)),
            ],
        );

        Some(DeviceSetup {
            ticket,
            token,
            api: Arc::clone(&self.api),
            factory: Arc::clone(&self.factory),
        })
    }

    /// Connect a finished setup. Results for a setup that is no longer the
    /// in-flight one are dropped without ever touching the output.
    pub fn finish_device_setup(&mut self, outcome: SetupOutcome) -> Option<Notification> {
        let SetupOutcome { ticket, result } = outcome;
        let current = self
            .setup
            .as_ref()
            .is_some_and(|in_flight| in_flight.ticket == ticket);
        if !current {
            self.audit(
                SessionAuditStage::DeviceSetupCancelled,
                [
                    ("patch_id", json!(ticket.patch_id)),
                    ("setup_id", json!(ticket.id)),
                    ("stale", json!(true)),
                ],
            );
            return None;
        }
        self.setup = None;

        let outcome = result
            .map_err(PatchGridError::from)
            .and_then(|device| self.connect(device));
        match outcome {
            Ok(()) => None,
            Err(PatchGridError::Device(DeviceError::Cancelled)) => {
                self.audit(
                    SessionAuditStage::DeviceSetupCancelled,
                    [("patch_id", json!(ticket.patch_id))],
                );
                None
            }
            Err(err) => {
                self.audit(
                    SessionAuditStage::DeviceSetupFailed,
                    [
                        ("patch_id", json!(ticket.patch_id)),
                        ("error", json!(err.to_string())),
                    ],
                );
                self.log(
                    LogLevel::Error,
                    "device_setup_failed",
                    [
                        json_str("patch_id", ticket.patch_id.as_str()),
                        json_str("error", err.to_string()),
                    ],
                );
                Some(Notification::DeviceSetupFailed {
                    patch_id: ticket.patch_id,
                    message: err.to_string(),
                })
            }
        }
    }

    /// Build and connect a device for the selected patch in one step.
    pub async fn setup_device(&mut self) -> Option<Notification> {
        let setup = self.begin_device_setup()?;
        let outcome = setup.run().await;
        self.finish_device_setup(outcome)
    }

    /// Snapshot of the arrangement as it would be saved now.
    pub fn current_layout(&self) -> Option<Layout> {
        let patch_id = self.patch_id.as_deref()?;
        Some(
            Layout::new(patch_id, self.grid.serialize())
                .with_columns(clamp_columns(self.grid.columns() as i64))
                .with_labels(self.show_labels),
        )
    }

    pub fn begin_save(&self) -> Result<LayoutSave<A>> {
        let layout = self.current_layout().ok_or(PatchGridError::NoPatchSelected)?;
        let request =
            UpdateLayoutRequest::new(layout.entries, layout.num_columns, layout.show_labels);
        Ok(LayoutSave {
            patch_id: layout.patch_id,
            request,
            api: Arc::clone(&self.api),
        })
    }

    /// Record a save result. Failures are reported, never retried, and the
    /// in-memory placement is kept so the user can try again.
    pub fn finish_save(&mut self, outcome: SaveOutcome) -> Notification {
        let SaveOutcome {
            patch_id,
            num_columns,
            result,
        } = outcome;
        match result {
            Ok(()) => {
                if self.patch_id.as_deref() == Some(patch_id.as_str()) {
                    self.persisted_columns = Some(num_columns);
                    self.pending_columns = None;
                }
                self.with_metrics(|metrics| metrics.record_save(true));
                self.audit(
                    SessionAuditStage::SaveCommitted,
                    [
                        ("patch_id", json!(patch_id)),
                        ("columns", json!(num_columns)),
                    ],
                );
                self.log(
                    LogLevel::Info,
                    "layout_saved",
                    [json_str("patch_id", patch_id.as_str())],
                );
                Notification::LayoutSaved { patch_id }
            }
            Err(err) => {
                self.with_metrics(|metrics| metrics.record_save(false));
                self.audit(
                    SessionAuditStage::SaveFailed,
                    [
                        ("patch_id", json!(patch_id)),
                        ("error", json!(err.to_string())),
                    ],
                );
                self.log(
                    LogLevel::Warn,
                    "layout_save_failed",
                    [
                        json_str("patch_id", patch_id.as_str()),
                        json_str("error", err.to_string()),
                    ],
                );
                Notification::SaveFailed {
                    patch_id,
                    message: err.to_string(),
                }
            }
        }
    }

    pub async fn save_layout(&mut self) -> Result<Notification> {
        let save = self.begin_save()?;
        let outcome = save.run().await;
        Ok(self.finish_save(outcome))
    }

    /// Discard unsaved edits by reloading the stored layout. Loads started
    /// before this call go stale.
    pub fn cancel_edits(&mut self) -> Result<LayoutLoad<A>> {
        self.generation += 1;
        self.pending_columns = None;
        self.active_drag = None;
        self.begin_load()
    }

    pub fn toggle_labels(&mut self) -> bool {
        self.show_labels = !self.show_labels;
        self.show_labels
    }

    /// Unsaved column choice. Applies to the grid now and wins over the
    /// stored value on the next load of this patch.
    pub fn set_pending_columns(&mut self, now: Instant, columns: u8) -> Result<()> {
        self.grid.set_columns(now, columns as u32)?;
        self.pending_columns = Some(columns);
        Ok(())
    }

    pub fn set_mode(&mut self, mode: GridMode) {
        self.grid.set_mode(mode);
        self.router.set_interactive(mode == GridMode::Interact);
        self.active_drag = None;
    }

    /// Host reported a new container width. Applied on a later tick.
    pub fn resize(&mut self, now: Instant, container_width: f32) {
        self.grid.request_resize(now, container_width);
    }

    pub fn move_widget(&mut self, widget_id: &str, x: u32, y: u32) -> Result<GridRect> {
        Ok(self.grid.move_widget(widget_id, x, y)?)
    }

    pub fn resize_widget(&mut self, widget_id: &str, w: u32, h: u32) -> Result<GridRect> {
        Ok(self.grid.resize_widget(widget_id, w, h)?)
    }

    /// Pointer pressed at container pixel `(px, py)`. In interact mode the
    /// widget under it receives the gesture.
    pub fn pointer_down(&mut self, px: f32, py: f32, now: Instant) -> Result<Option<PointerRoute>> {
        let Some(route) = self.grid.pointer_route(px, py) else {
            return Ok(None);
        };
        if let PointerRoute::Widget(widget_id) = &route {
            self.widget_gesture(widget_id, (px, py), now)?;
        }
        Ok(Some(route))
    }

    /// Continue an active widget drag. Returns the written parameter value.
    pub fn pointer_move(&mut self, px: f32, py: f32) -> Result<Option<f64>> {
        match self.active_drag.clone() {
            Some(widget_id) => self.router.drag_to(&widget_id, (px, py)),
            None => Ok(None),
        }
    }

    pub fn pointer_up(&mut self) -> Result<()> {
        match self.active_drag.take() {
            Some(widget_id) => self.router.end_drag(&widget_id),
            None => Ok(()),
        }
    }

    fn widget_gesture(&mut self, widget_id: &str, pointer: (f32, f32), now: Instant) -> Result<()> {
        let Some(axis) = self.router.drag_axis(widget_id) else {
            // Display and inert widgets have no input binding.
            return match self.router.press(widget_id, now) {
                Ok(_) | Err(PatchGridError::WidgetNotFound(_)) => Ok(()),
                Err(err) => Err(err),
            };
        };
        let extent = self.widget_extent(widget_id, axis);
        if self.router.begin_drag(widget_id, pointer, extent)? {
            self.active_drag = Some(widget_id.to_string());
        }
        Ok(())
    }

    fn widget_extent(&self, widget_id: &str, axis: DragAxis) -> f32 {
        let cell = self.grid.geometry().cell_size;
        self.grid
            .presented()
            .into_iter()
            .find(|(id, _)| id == widget_id)
            .map(|(_, rect)| match axis {
                DragAxis::Horizontal => rect.w as f32 * cell,
                DragAxis::Vertical | DragAxis::Rotary => rect.h as f32 * cell,
            })
            .unwrap_or(cell)
    }

    /// Advance time: due button resets, a settled reflow, and the periodic
    /// metrics snapshot.
    pub fn tick(&mut self, now: Instant) -> SessionTick {
        let resets = self.router.tick(now);
        let reflow = self.grid.poll_reflow(now);
        if let Some(geometry) = reflow {
            self.with_metrics(SessionMetrics::record_reflow);
            self.log_to(
                GRID_TARGET,
                LogLevel::Debug,
                "reflowed",
                [
                    json_kv("columns", geometry.columns),
                    json_kv("cell_size", geometry.cell_size),
                ],
            );
        }
        SessionTick {
            resets,
            reflow,
            metrics_emitted: self.maybe_emit_metrics(now),
        }
    }

    fn is_current(&self, ticket: &LayoutTicket) -> bool {
        ticket.generation == self.generation
            && self.patch_id.as_deref() == Some(ticket.patch_id.as_str())
    }

    fn cancel_setup(&mut self) {
        if let Some(in_flight) = self.setup.take() {
            in_flight.token.cancel();
            self.audit(
                SessionAuditStage::DeviceSetupCancelled,
                [
                    ("patch_id", json!(in_flight.ticket.patch_id)),
                    ("setup_id", json!(in_flight.ticket.id)),
                ],
            );
        }
    }

    fn teardown_device(&mut self) {
        self.router.detach();
        self.active_drag = None;
        if let Some(device) = self.device.take() {
            self.output.disconnect(&device);
            self.readiness = self.readiness.device_torn_down();
            self.audit(
                SessionAuditStage::DeviceTornDown,
                [("instance_id", json!(device.instance_id()))],
            );
        }
    }

    fn connect(&mut self, device: Device) -> Result<()> {
        self.teardown_device();
        let readiness = self.readiness.device_connected()?;
        self.output.connect(&device)?;
        self.readiness = readiness;
        self.seed_random(&device);

        let device = Arc::new(device);
        self.router.attach(Arc::clone(&device));
        self.device = Some(Arc::clone(&device));
        self.render_board();

        self.with_metrics(SessionMetrics::record_device_connected);
        self.audit(
            SessionAuditStage::DeviceConnected,
            [
                ("patch_id", json!(device.patch_id())),
                ("instance_id", json!(device.instance_id())),
            ],
        );
        self.log(
            LogLevel::Info,
            "device_connected",
            [
                json_str("patch_id", device.patch_id()),
                json_kv("instance_id", device.instance_id()),
                json_kv("parameters", device.parameters().len()),
                json_kv("outports", device.outports().len()),
            ],
        );
        Ok(())
    }

    fn seed_random(&self, device: &Device) {
        let settings = &self.config.settings;
        if !settings.randomize_seed {
            return;
        }
        let Some(parameter) = device.parameter_by_name(&settings.seed_parameter) else {
            return;
        };
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or(0);
        let value = parameter.set_value(random_seed_value(unix_ms));
        self.log(
            LogLevel::Debug,
            "random_seed_set",
            [
                json_str("parameter", parameter.id()),
                json_kv("value", value),
            ],
        );
    }

    /// Mirror the grid onto the board and rebind the router when a device
    /// is live.
    fn render_board(&mut self) {
        let entries = self.grid.serialize();
        let missing = match self.board.write() {
            Ok(mut board) => {
                board.sync_entries(&entries);
                board.mark_inert(self.inert.iter().map(String::as_str))
            }
            Err(_) => Vec::new(),
        };
        for widget_id in missing {
            self.log(
                LogLevel::Debug,
                "board_out_of_sync",
                [json_str("widget_id", widget_id)],
            );
        }
        if self.router.device().is_none() {
            return;
        }
        match self.router.bind_layout(&entries) {
            Ok(report) => self.inert = report.inert,
            Err(err) => self.log(
                LogLevel::Error,
                "layout_bind_failed",
                [json_str("error", err.to_string())],
            ),
        }
    }

    fn maybe_emit_metrics(&mut self, now: Instant) -> bool {
        let interval = self.config.settings.metrics_interval();
        if self.config.metrics.is_none() || interval.is_zero() {
            return false;
        }
        match self.last_metrics_emit {
            Some(last) if now.saturating_duration_since(last) < interval => return false,
            _ => self.last_metrics_emit = Some(now),
        }

        let uptime = now.saturating_duration_since(self.started);
        if let (Some(logger), Some(metrics)) =
            (self.config.logger.as_ref(), self.config.metrics.as_ref())
        {
            if let Ok(guard) = metrics.lock() {
                let target = self.config.metrics_target.as_str();
                let _ = logger.emit(&guard.snapshot(uptime).to_log_event(target));
            }
        }
        true
    }

    fn with_metrics(&self, record: impl FnOnce(&mut SessionMetrics)) {
        if let Some(metrics) = self.config.metrics.as_ref() {
            if let Ok(mut guard) = metrics.lock() {
                record(&mut guard);
            }
        }
    }

    fn audit<const N: usize>(&self, stage: SessionAuditStage, details: [(&str, Value); N]) {
        let event = details
            .into_iter()
            .fold(SessionAuditEventBuilder::new(stage), |builder, (key, value)| {
                builder.detail(key, value)
            })
            .finish();
        self.config.audit.record(event);
    }

    fn log<I>(&self, level: LogLevel, message: &str, fields: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.log_to(SESSION_TARGET, level, message, fields);
    }

    fn log_to<I>(&self, target: &str, level: LogLevel, message: &str, fields: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        if let Some(logger) = self.config.logger.as_ref() {
            let _ = logger.emit(&event_with_fields(level, target, message, fields));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeadlessDeviceFactory;
    use crate::logging::{Logger, MemorySink, METRICS_TARGET};
    use crate::persistence::{LayoutDocument, MemoryLayoutApi};
    use crate::runtime::NotificationLevel;
    use crate::runtime::audit::RecordingAudit;
    use crate::widget::DisplayValue;
    use crate::device::OutportMessage;
    use std::time::Duration;

    type Session = EditorSession<MemoryLayoutApi, HeadlessDeviceFactory>;

    fn patch_document() -> Value {
        json!({
            "desc": {
                "parameters": [
                    {"paramId": "trig"},
                    {"paramId": "cutoff", "minimum": 20.0, "maximum": 220.0},
                    {"paramId": "seed", "name": "randomSeed"}
                ],
                "outports": [{"tag": "level"}]
            }
        })
    }

    fn associations() -> UiAssociations {
        UiAssociations::from_pairs([("trig", "button"), ("cutoff", "vslider"), ("level", "numberBox")])
    }

    fn api(patches: &[&str]) -> MemoryLayoutApi {
        let api = MemoryLayoutApi::new();
        for patch_id in patches {
            api.insert_patch(patch_id, patch_document(), associations());
        }
        api
    }

    fn session_with(api: &MemoryLayoutApi, audit: &RecordingAudit, logger: Option<Logger>) -> Session {
        let mut config = SessionConfig::default().with_audit(Arc::new(audit.clone()));
        config.logger = logger;
        config.enable_metrics();
        EditorSession::new(
            Arc::new(api.clone()),
            Arc::new(HeadlessDeviceFactory::new()),
            config,
        )
        .unwrap()
    }

    fn session(api: &MemoryLayoutApi) -> Session {
        session_with(api, &RecordingAudit::new(), None)
    }

    fn ids(session: &Session) -> Vec<String> {
        let mut ids: Vec<String> = session
            .grid()
            .serialize()
            .into_iter()
            .map(|entry| entry.widget_id)
            .collect();
        ids.sort();
        ids
    }

    fn snapshot(session: &Session) -> crate::metrics::MetricSnapshot {
        session
            .config()
            .metrics_handle()
            .unwrap()
            .lock()
            .unwrap()
            .snapshot(Duration::ZERO)
    }

    #[tokio::test]
    async fn unreadable_description_falls_back_to_associations() {
        let api = api(&["p1"]);
        api.fail_patch_fetches(true);
        let mut session = session(&api);
        session.select_patch("p1");
        assert_eq!(session.load_layout(Instant::now()).await.unwrap(), None);
        assert_eq!(ids(&session), ["button1", "numberBox3", "vslider2"]);
        assert!(session.inert_widgets().is_empty());
    }

    #[tokio::test]
    async fn missing_layout_resolves_defaults() {
        let api = api(&["p1"]);
        let mut session = session(&api);
        session.select_patch("p1");
        assert_eq!(session.load_layout(Instant::now()).await.unwrap(), None);

        assert_eq!(ids(&session), ["button1", "numberBox3", "vslider2"]);
        assert_eq!(session.grid().columns(), 16);
        assert!(session.show_labels());
        assert_eq!(session.board().read().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn stale_load_never_applies() {
        let api = api(&["a", "b"]);
        api.insert_layout(
            "a",
            serde_json::from_value::<LayoutDocument>(json!({
                "layout": [{"id": "button9", "x": 5, "y": 5, "association": {"id": "trig", "type": "button"}}],
                "numColumns": 8
            }))
            .unwrap(),
        );
        let audit = RecordingAudit::new();
        let mut session = session_with(&api, &audit, None);

        session.select_patch("a");
        let load_a = session.begin_load().unwrap();
        session.select_patch("b");
        let load_b = session.begin_load().unwrap();

        let outcome_b = load_b.run().await;
        assert_eq!(session.apply_layout(outcome_b, Instant::now()), None);
        let outcome_a = load_a.run().await;
        assert_eq!(session.apply_layout(outcome_a, Instant::now()), None);

        assert_eq!(ids(&session), ["button1", "numberBox3", "vslider2"]);
        assert_eq!(session.grid().columns(), 16);
        assert_eq!(snapshot(&session).stale_loads_discarded, 1);
        assert_eq!(audit.count(SessionAuditStage::StaleLayoutDiscarded), 1);
    }

    #[tokio::test]
    async fn failed_load_keeps_current_placement() {
        let api = api(&["p1"]);
        let mut session = session(&api);
        session.select_patch("p1");
        session.load_layout(Instant::now()).await.unwrap();

        api.fail_loads(true);
        let note = session.load_layout(Instant::now()).await.unwrap().unwrap();
        assert!(matches!(note, Notification::LoadFailed { .. }));
        assert_eq!(note.level(), NotificationLevel::Warning);
        assert_eq!(session.grid().len(), 3);
    }

    #[tokio::test]
    async fn pending_columns_beat_stored_columns() {
        let api = api(&["p1", "p2"]);
        api.insert_layout(
            "p1",
            LayoutDocument {
                layout: Some(Vec::new()),
                num_columns: Some(12),
                show_labels: Some(false),
            },
        );
        let mut session = session(&api);

        session.select_patch("p1");
        session.load_layout(Instant::now()).await.unwrap();
        assert_eq!(session.grid().columns(), 12);
        assert!(!session.show_labels());
        assert_eq!(session.grid().len(), 3);

        session.select_patch("p1");
        let load = session.begin_load().unwrap();
        session.set_pending_columns(Instant::now(), 8).unwrap();
        let outcome = load.run().await;
        session.apply_layout(outcome, Instant::now());
        assert_eq!(session.grid().columns(), 8);
        assert_eq!(session.persisted_columns(), Some(12));

        session.select_patch("p2");
        session.load_layout(Instant::now()).await.unwrap();
        assert_eq!(session.grid().columns(), 16);
        assert!(session.show_labels());
    }

    #[tokio::test]
    async fn device_setup_waits_for_first_gesture() {
        let api = api(&["p1"]);
        let mut session = session(&api);
        session.select_patch("p1");
        assert!(session.setup_device().await.is_none());
        assert!(session.device().is_none());

        assert!(session.observe_first_gesture());
        assert!(!session.observe_first_gesture());
        assert_eq!(session.setup_device().await, None);
        let device = session.device().unwrap();
        assert_eq!(session.output().active(), Some(device.instance_id()));
        assert_eq!(session.readiness(), AudioReadiness::ReadyWithDevice);

        let seed = device.parameter_by_name("randomSeed").unwrap().value();
        assert!((0.0..1.0).contains(&seed));
    }

    #[test]
    fn seed_is_millisecond_fraction() {
        assert_eq!(random_seed_value(1_700_000_000_567), 0.567);
        assert_eq!(random_seed_value(2_000), 0.0);
    }

    #[tokio::test]
    async fn reentrant_setup_is_dropped() {
        let api = api(&["p1"]);
        let audit = RecordingAudit::new();
        let mut session = session_with(&api, &audit, None);
        session.observe_first_gesture();
        session.select_patch("p1");

        let first = session.begin_device_setup().unwrap();
        assert!(session.begin_device_setup().is_none());
        assert_eq!(audit.count(SessionAuditStage::DeviceSetupDropped), 1);

        let outcome = first.run().await;
        assert_eq!(session.finish_device_setup(outcome), None);
        assert!(session.device().is_some());
        assert!(!session.is_setup_in_flight());
    }

    #[tokio::test]
    async fn switching_patch_cancels_inflight_setup() {
        let api = api(&["a", "b"]);
        api.hold_patch_fetches();
        let mut session = session(&api);
        session.observe_first_gesture();
        session.select_patch("a");

        let setup = session.begin_device_setup().unwrap();
        let pending = tokio::spawn(setup.run());
        tokio::task::yield_now().await;
        session.select_patch("b");

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome.result, Err(DeviceError::Cancelled)));
        assert_eq!(session.finish_device_setup(outcome), None);
        assert!(session.device().is_none());
        assert_eq!(session.output().active(), None);

        api.release_patch_fetches();
        assert_eq!(session.setup_device().await, None);
        assert_eq!(session.device().unwrap().patch_id(), "b");
    }

    #[tokio::test]
    async fn stale_setup_result_is_never_connected() {
        let api = api(&["a", "b"]);
        let mut session = session(&api);
        session.observe_first_gesture();
        session.select_patch("a");
        let setup = session.begin_device_setup().unwrap();
        let outcome = setup.run().await;
        assert!(outcome.result.is_ok());

        session.select_patch("b");
        assert_eq!(session.finish_device_setup(outcome), None);
        assert!(session.device().is_none());
        assert_eq!(session.output().active(), None);
    }

    #[tokio::test]
    async fn at_most_one_device_is_connected() {
        let api = api(&["a", "b"]);
        let mut session = session(&api);
        session.observe_first_gesture();
        session.select_patch("a");
        session.load_layout(Instant::now()).await.unwrap();
        session.setup_device().await;
        let first = Arc::clone(session.device().unwrap());
        assert_eq!(first.messages().subscriber_count(), 1);

        session.select_patch("b");
        assert_eq!(first.messages().subscriber_count(), 0);
        assert_eq!(session.output().active(), None);
        assert_eq!(session.readiness(), AudioReadiness::ReadyNoDevice);

        session.setup_device().await;
        let second = session.device().unwrap();
        assert_ne!(first.instance_id(), second.instance_id());
        assert_eq!(session.output().active(), Some(second.instance_id()));
    }

    #[tokio::test]
    async fn malformed_description_raises_alert() {
        let api = MemoryLayoutApi::new();
        api.insert_patch("bad", json!({"patcher": {}}), associations());
        let mut session = session(&api);
        session.observe_first_gesture();
        session.select_patch("bad");

        let note = session.setup_device().await.unwrap();
        assert_eq!(note.level(), NotificationLevel::Alert);
        assert!(session.device().is_none());
        assert_eq!(session.output().active(), None);

        session.load_layout(Instant::now()).await.unwrap();
        assert_eq!(session.grid().len(), 3);
    }

    #[tokio::test]
    async fn failed_save_keeps_edits_for_retry() {
        let api = api(&["p1"]);
        let mut session = session(&api);
        session.select_patch("p1");
        session.load_layout(Instant::now()).await.unwrap();
        session.move_widget("button1", 6, 2).unwrap();

        api.fail_saves(true);
        let note = session.save_layout().await.unwrap();
        assert!(matches!(note, Notification::SaveFailed { .. }));
        assert!(api.layout("p1").is_none());
        assert_eq!(session.grid().rect_of("button1"), Some(GridRect::new(6, 2, 1, 1)));

        api.fail_saves(false);
        let note = session.save_layout().await.unwrap();
        assert_eq!(note, Notification::LayoutSaved { patch_id: "p1".into() });
        let stored = api.layout("p1").unwrap();
        assert_eq!(stored.layout.map(|entries| entries.len()), Some(3));
        assert_eq!(stored.num_columns, Some(16));

        let counts = snapshot(&session);
        assert_eq!((counts.saves_ok, counts.saves_failed), (1, 1));
    }

    #[tokio::test]
    async fn cancel_edits_reloads_stored_layout() {
        let api = api(&["p1"]);
        let mut session = session(&api);
        session.select_patch("p1");
        session.load_layout(Instant::now()).await.unwrap();
        session.save_layout().await.unwrap();

        session.move_widget("button1", 9, 9).unwrap();
        let reload = session.cancel_edits().unwrap();
        let outcome = reload.run().await;
        session.apply_layout(outcome, Instant::now());
        assert_eq!(session.grid().rect_of("button1"), Some(GridRect::new(0, 0, 1, 1)));
    }

    #[tokio::test]
    async fn interact_mode_routes_pointer_to_parameters() {
        let api = api(&["p1"]);
        let mut session = session(&api);
        session.observe_first_gesture();
        session.select_patch("p1");
        session.load_layout(Instant::now()).await.unwrap();
        session.setup_device().await;
        let device = Arc::clone(session.device().unwrap());
        let trig = device.parameter("trig").unwrap();
        let cutoff = device.parameter("cutoff").unwrap();

        // Edit mode drags cells, not values.
        let start = Instant::now();
        assert_eq!(
            session.pointer_down(40.0, 40.0, start).unwrap(),
            Some(PointerRoute::Cell("button1".into()))
        );
        assert_eq!(trig.value(), 0.0);

        session.set_mode(GridMode::Interact);
        session.pointer_down(40.0, 40.0, start).unwrap();
        assert_eq!(trig.value(), 1.0);
        assert_eq!(session.tick(start + Duration::from_millis(40)).resets, 1);
        assert_eq!(trig.value(), 0.0);

        // vslider2 spans rows 0..3 of column 1; 80px cells at 1280px.
        session.pointer_down(120.0, 200.0, start).unwrap();
        assert_eq!(session.pointer_move(120.0, 80.0).unwrap(), Some(120.0));
        session.pointer_up().unwrap();
        assert_eq!(session.pointer_move(120.0, 0.0).unwrap(), None);
        assert_eq!(cutoff.value(), 120.0);

        assert!(session.move_widget("button1", 3, 3).is_err());
    }

    #[tokio::test]
    async fn outport_messages_reach_rendered_widgets() {
        let api = api(&["p1"]);
        let mut session = session(&api);
        session.observe_first_gesture();
        session.select_patch("p1");
        session.load_layout(Instant::now()).await.unwrap();
        session.setup_device().await;

        let device = Arc::clone(session.device().unwrap());
        device.emit(OutportMessage::new("level", 1500.0));
        let board = session.board().read().unwrap();
        assert_eq!(
            board.display_of("numberBox3"),
            Some(&DisplayValue::Text("2k+".into()))
        );
    }

    #[tokio::test]
    async fn stale_saved_entries_render_inert() {
        let api = api(&["p1"]);
        api.insert_layout(
            "p1",
            serde_json::from_value::<LayoutDocument>(json!({
                "layout": [
                    {"id": "dial1", "x": 0, "y": 0, "association": {"id": "renamed", "type": "dial"}},
                    {"id": "button2", "x": 1, "y": 0, "association": {"id": "trig", "type": "button"}}
                ]
            }))
            .unwrap(),
        );
        let mut session = session(&api);
        session.observe_first_gesture();
        session.select_patch("p1");
        session.load_layout(Instant::now()).await.unwrap();
        assert_eq!(session.inert_widgets(), ["dial1".to_string()]);

        session.setup_device().await;
        assert_eq!(session.inert_widgets(), ["dial1".to_string()]);
        assert_eq!(session.grid().len(), 2);
        assert!(session.board().read().unwrap().get("dial1").unwrap().inert);
    }

    #[tokio::test]
    async fn tick_applies_reflow_and_emits_metrics() {
        let api = api(&["p1"]);
        let sink = MemorySink::new();
        let mut session = session_with(&api, &RecordingAudit::new(), Some(Logger::new(sink.clone())));
        let start = Instant::now();

        session.resize(start, 700.0);
        session.resize(start + Duration::from_millis(100), 600.0);
        assert_eq!(session.tick(start + Duration::from_millis(200)).reflow, None);
        let tick = session.tick(start + Duration::from_millis(400));
        assert_eq!(tick.reflow.map(|geometry| geometry.columns), Some(10));

        let later = session.tick(start + Duration::from_secs(6));
        assert!(later.metrics_emitted);
        assert_eq!(
            sink.messages_for(METRICS_TARGET),
            vec!["session_metrics".to_string()]
        );
        assert_eq!(sink.messages_for(GRID_TARGET), vec!["reflowed".to_string()]);
        assert_eq!(snapshot(&session).reflows, 1);
    }
}
