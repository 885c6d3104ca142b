use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{Criterion, criterion_group, criterion_main};
use patchgrid::logging::{LogEvent, LogSink};
use patchgrid::{
    EventRouter, GridEngine, HeadlessDeviceFactory, LayoutEntry, Logger, LoggingResult,
    OutportMessage, OutportSpec, ParameterSpec, PatchDescription, SessionMetrics,
    WidgetAssociation, WidgetBoard, WidgetType,
};

#[derive(Clone, Default)]
struct NullSink;

impl LogSink for NullSink {
    fn write(&self, _event: &LogEvent) -> LoggingResult<()> {
        Ok(())
    }
}

const WIDGETS: usize = 96;

fn entries() -> Vec<LayoutEntry> {
    (0..WIDGETS)
        .map(|idx| {
            let widget_type = WidgetType::ALL[idx % WidgetType::ALL.len()];
            let control = match widget_type {
                WidgetType::Light | WidgetType::NumberBox => format!("out{}", idx % 8),
                _ => format!("param{idx}"),
            };
            LayoutEntry::floating(
                widget_type.widget_id(idx + 1),
                WidgetAssociation::new(control, widget_type),
            )
        })
        .collect()
}

fn description() -> PatchDescription {
    PatchDescription::new(
        (0..WIDGETS)
            .map(|idx| ParameterSpec::new(format!("param{idx}"), 0.0, 1.0))
            .collect(),
        (0..8)
            .map(|idx| OutportSpec {
                tag: format!("out{idx}"),
            })
            .collect(),
    )
}

fn grid_float_placement(c: &mut Criterion) {
    let entries = entries();
    c.bench_function("grid_float_placement", |b| {
        b.iter(|| {
            let mut grid = GridEngine::initialize(16, 1280.0).expect("grid");
            for entry in &entries {
                grid.add_widget(black_box(entry)).expect("placement");
            }
            black_box(grid.serialize());
        });
    });
}

fn grid_responsive_reflow(c: &mut Criterion) {
    let mut grid = GridEngine::initialize(16, 1280.0).expect("grid");
    for entry in entries() {
        grid.add_widget(&entry).expect("placement");
    }
    let widths = [1280.0, 900.0, 700.0, 500.0, 320.0];
    c.bench_function("grid_responsive_reflow", |b| {
        b.iter(|| {
            let start = Instant::now();
            for (step, width) in widths.iter().enumerate() {
                grid.request_resize(start + Duration::from_millis(step as u64 * 50), *width);
            }
            grid.poll_reflow(start + Duration::from_secs(1));
            black_box(grid.presented());
        });
    });
}

fn router_message_fanout(c: &mut Criterion) {
    let entries = entries();
    let board = WidgetBoard::shared();
    board.write().expect("board").sync_entries(&entries);
    let device = Arc::new(HeadlessDeviceFactory::new().build("bench", &description()));
    let mut router = EventRouter::new(board)
        .with_logger(Some(Logger::new(NullSink)))
        .with_metrics(Some(Arc::new(std::sync::Mutex::new(SessionMetrics::new()))));
    router.attach(Arc::clone(&device));
    router.bind_layout(&entries).expect("bind");

    c.bench_function("router_message_fanout", |b| {
        let mut value = 0.0;
        b.iter(|| {
            value += 1.0;
            for idx in 0..8 {
                device.emit(OutportMessage::new(format!("out{idx}"), black_box(value)));
            }
        });
    });
}

criterion_group!(
    benches,
    grid_float_placement,
    grid_responsive_reflow,
    router_message_fanout
);
criterion_main!(benches);
