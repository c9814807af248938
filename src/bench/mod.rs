use std::cell::{Cell, RefCell};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use xxhash_rust::xxh3::xxh3_64;

use mediagrid::anchor::AnchorStats;
use mediagrid::media::{ElementOptions, MediaEventSink};
use mediagrid::models::{FileSignal, ResolvedSource};
use mediagrid::{
    GridConfig, LayoutTrigger, ManualScheduler, MediaBackend, MediaElement, MediaErrorCode,
    MediaEvent, MediaGrid, MediaKind, Scheduler, TileId, TileInput, VirtualScroll, ZoomLevel,
};

#[derive(Debug, Clone)]
pub struct BenchmarkArgs {
    pub path: PathBuf,
    pub runs: usize,
    pub width: f64,
    pub viewport_height: f64,
    pub scroll_step: f64,
    pub frames_per_step: usize,
    pub zoom: ZoomLevel,
}

#[derive(Debug)]
struct BenchmarkRun {
    run_index: usize,
    elapsed_ms: u128,
    total_files: usize,
    videos: usize,
    scan_ms: u128,
    columns: usize,
    content_height: f64,
    layout_passes: usize,
    aspect_passes: usize,
    layout_p50_ms: f64,
    layout_p95_ms: f64,
    frames_simulated: usize,
    frame_p50_ms: f64,
    frame_p95_ms: f64,
    frames_over_16ms: usize,
    loads: usize,
    elements_created: usize,
    plays: usize,
    anchor: AnchorStats,
}

#[derive(Debug)]
struct BenchmarkReport {
    schema_version: u32,
    generated_at_unix_ms: u128,
    path: String,
    runs_requested: usize,
    width: f64,
    viewport_height: f64,
    zoom: &'static str,
    runs: Vec<BenchmarkRun>,
}

pub fn maybe_parse_args() -> Result<Option<BenchmarkArgs>> {
    parse_args(env::args().skip(1))
}

fn parse_args<I: IntoIterator<Item = String>>(input: I) -> Result<Option<BenchmarkArgs>> {
    let mut benchmark = false;
    let mut path: Option<PathBuf> = None;
    let mut runs: usize = 1;
    let mut width: f64 = 1600.0;
    let mut viewport_height: f64 = 900.0;
    let mut scroll_step: f64 = 240.0;
    let mut frames_per_step: usize = 4;
    let mut zoom = ZoomLevel::default();

    let mut args = input.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--benchmark" => benchmark = true,
            "--path" => {
                let value = args
                    .next()
                    .context("Missing value for --path in benchmark mode")?;
                path = Some(PathBuf::from(value));
            }
            "--runs" => {
                let value = args
                    .next()
                    .context("Missing value for --runs in benchmark mode")?;
                runs = value
                    .parse::<usize>()
                    .context("Failed to parse --runs as a positive integer")?;
            }
            "--width" => {
                let value = args
                    .next()
                    .context("Missing value for --width in benchmark mode")?;
                width = value
                    .parse::<f64>()
                    .context("Failed to parse --width as a number of pixels")?;
            }
            "--viewport-height" => {
                let value = args
                    .next()
                    .context("Missing value for --viewport-height in benchmark mode")?;
                viewport_height = value
                    .parse::<f64>()
                    .context("Failed to parse --viewport-height as a number of pixels")?;
            }
            "--scroll-step" => {
                let value = args
                    .next()
                    .context("Missing value for --scroll-step in benchmark mode")?;
                scroll_step = value
                    .parse::<f64>()
                    .context("Failed to parse --scroll-step as a number of pixels")?;
            }
            "--frames-per-step" => {
                let value = args
                    .next()
                    .context("Missing value for --frames-per-step in benchmark mode")?;
                frames_per_step = value
                    .parse::<usize>()
                    .context("Failed to parse --frames-per-step as a positive integer")?;
            }
            "--zoom" => {
                let value = args
                    .next()
                    .context("Missing value for --zoom in benchmark mode")?;
                zoom = match value.as_str() {
                    "compact" => ZoomLevel::Compact,
                    "comfortable" => ZoomLevel::Comfortable,
                    "large" => ZoomLevel::Large,
                    other => bail!("Unknown --zoom level: {other} (compact|comfortable|large)"),
                };
            }
            _ => {
                if benchmark && path.is_none() && !arg.starts_with('-') {
                    path = Some(PathBuf::from(arg));
                }
            }
        }
    }

    if !benchmark {
        return Ok(None);
    }
    if runs == 0 {
        bail!("--runs must be greater than 0");
    }
    if !(width > 0.0) || !(viewport_height > 0.0) {
        bail!("--width and --viewport-height must be greater than 0");
    }
    if !(scroll_step > 0.0) {
        bail!("--scroll-step must be greater than 0");
    }
    if frames_per_step == 0 {
        bail!("--frames-per-step must be greater than 0");
    }

    let path = path.context("Benchmark mode requires --path <directory> (or positional path)")?;
    Ok(Some(BenchmarkArgs {
        path,
        runs,
        width,
        viewport_height,
        scroll_step,
        frames_per_step,
        zoom,
    }))
}

pub fn run_benchmark(args: BenchmarkArgs) -> Result<i32> {
    if !args.path.exists() {
        bail!("Benchmark path does not exist: {}", args.path.display());
    }
    if !args.path.is_dir() {
        bail!("Benchmark path is not a directory: {}", args.path.display());
    }

    let output_dir = PathBuf::from("target/mediagrid-bench");
    fs::create_dir_all(&output_dir).context("Failed to create benchmark output directory")?;

    let mut runs = Vec::with_capacity(args.runs);
    for run_index in 0..args.runs {
        let run_number = run_index + 1;
        println!("run={} phase=begin", run_number);
        let start = Instant::now();

        println!("run={} phase=scan start", run_number);
        let scan_start = Instant::now();
        let items = scan_media(&args.path)?;
        let scan_ms = scan_start.elapsed().as_millis();
        let videos = items.iter().filter(|i| i.kind.is_video()).count();
        println!(
            "run={} phase=scan done total={} videos={} ms={}",
            run_number,
            items.len(),
            videos,
            scan_ms
        );

        println!("run={} phase=scroll start", run_number);
        let mut run = simulate_scroll(items, &args, run_index)?;
        run.scan_ms = scan_ms;
        run.videos = videos;
        run.elapsed_ms = start.elapsed().as_millis();
        println!(
            "run={} phase=scroll done columns={} frames={} p95_ms={:.2} loads={} anchor_applied={}",
            run_number,
            run.columns,
            run.frames_simulated,
            run.frame_p95_ms,
            run.loads,
            run.anchor.applied
        );
        println!(
            "run={} layout_passes={} aspect_passes={} layout_p50_ms={:.3} layout_p95_ms={:.3} content_height={:.0}",
            run_number,
            run.layout_passes,
            run.aspect_passes,
            run.layout_p50_ms,
            run.layout_p95_ms,
            run.content_height
        );
        println!(
            "run={} elements_created={} plays={} anchor_started={} anchor_superseded={} anchor_abandoned={} anchor_skipped={}",
            run_number,
            run.elements_created,
            run.plays,
            run.anchor.started,
            run.anchor.superseded,
            run.anchor.abandoned,
            run.anchor.skipped
        );
        runs.push(run);
    }

    let frame_p95: Vec<f64> = runs.iter().map(|r| r.frame_p95_ms).collect();
    let layout_p95: Vec<f64> = runs.iter().map(|r| r.layout_p95_ms).collect();
    println!(
        "summary runs={} frame_p95_avg_ms={:.2} layout_p95_avg_ms={:.3}",
        runs.len(),
        average(&frame_p95),
        average(&layout_p95)
    );

    let report = BenchmarkReport {
        schema_version: 1,
        generated_at_unix_ms: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0),
        path: args.path.display().to_string(),
        runs_requested: args.runs,
        width: args.width,
        viewport_height: args.viewport_height,
        zoom: args.zoom.class_name(),
        runs,
    };
    let report_path = output_dir.join("report.json");
    fs::write(&report_path, render_report_json(&report))
        .with_context(|| format!("Failed to write {}", report_path.display()))?;
    println!("report={}", report_path.display());

    Ok(0)
}

/// Walks `root` for media files, sorted by path for stable runs.
fn scan_media(root: &Path) -> Result<Vec<TileInput>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "Skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_file() && MediaKind::from_path(entry.path()).is_some() {
            paths.push(entry.into_path());
        }
    }
    paths.sort();

    let items = paths
        .into_iter()
        .map(|path| {
            let signal = fs::metadata(&path)
                .map(|m| {
                    let mtime = m
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0);
                    FileSignal::new(m.len(), mtime)
                })
                .unwrap_or_default();
            let id = path.to_string_lossy().into_owned();
            TileInput::from_path(id, path).with_signal(signal)
        })
        .collect();
    Ok(items)
}

fn simulate_scroll(items: Vec<TileInput>, args: &BenchmarkArgs, run_index: usize) -> Result<BenchmarkRun> {
    let scheduler = Rc::new(ManualScheduler::new());
    let scroll = Rc::new(VirtualScroll::new(args.viewport_height));
    let backend = SimulatedBackend::new(scheduler.clone());
    let total_files = items.len();

    let grid = MediaGrid::builder(backend.clone())
        .config(GridConfig::global().clone())
        .scheduler(scheduler.clone())
        .surface(scroll.clone())
        .scroll(scroll.clone())
        .container_width(args.width)
        .zoom(args.zoom)
        .build()
        .context("Failed to build benchmark grid")?;

    let layout_passes = Rc::new(Cell::new(0usize));
    let aspect_passes = Rc::new(Cell::new(0usize));
    {
        let layout_passes = layout_passes.clone();
        let aspect_passes = aspect_passes.clone();
        grid.connect_layout_complete(move |trigger, _| {
            layout_passes.set(layout_passes.get() + 1);
            if trigger == LayoutTrigger::AspectRatio {
                aspect_passes.set(aspect_passes.get() + 1);
            }
        });
    }
    let loads = Rc::new(Cell::new(0usize));
    {
        let loads = loads.clone();
        grid.connect_load(move |_, _| loads.set(loads.get() + 1));
    }
    let plays = Rc::new(Cell::new(0usize));
    {
        let plays = plays.clone();
        grid.connect_play(move |_| plays.set(plays.get() + 1));
    }
    // Visible videos are started after the frame, outside the grid's callbacks.
    let to_play: Rc<RefCell<Vec<(TileId, bool)>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let to_play = to_play.clone();
        let videos: std::collections::HashSet<TileId> = items
            .iter()
            .filter(|i| i.kind.is_video())
            .map(|i| i.id.clone())
            .collect();
        grid.connect_visibility_changed(move |id, visible| {
            if videos.contains(id) {
                to_play.borrow_mut().push((id.clone(), visible));
            }
        });
    }

    let mut layout_times_ms = Vec::new();
    let mount_start = Instant::now();
    grid.set_items(items);
    layout_times_ms.push(mount_start.elapsed().as_secs_f64() * 1000.0);
    grid.start();

    let mut frame_times_ms = Vec::new();
    let mut frame = |grid: &MediaGrid<SimulatedBackend>| {
        let passes_before = layout_passes.get();
        let start = Instant::now();
        scheduler.frame();
        let pending: Vec<_> = to_play.borrow_mut().drain(..).collect();
        for (id, visible) in pending {
            if let Err(err) = grid.set_playing(&id, visible) {
                debug!(tile = %id, error = %err, "Play toggle for a removed tile");
            }
        }
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        frame_times_ms.push(ms);
        if layout_passes.get() > passes_before {
            layout_times_ms.push(ms);
        }
    };

    let mut y = 0.0;
    loop {
        for _ in 0..args.frames_per_step {
            frame(&grid);
        }
        let max = (scroll.content_height() - scroll.viewport_height()).max(0.0);
        if y >= max {
            break;
        }
        y = (y + args.scroll_step).min(max);
        scroll.set_scroll_top(y);
        grid.on_scroll();
    }

    // Let any outstanding anchor compensation finish.
    let mut drain_frames = 0;
    while grid.anchor().has_pending() && drain_frames < 120 {
        frame(&grid);
        drain_frames += 1;
    }

    let columns = grid
        .layout()
        .map(|l| l.metrics.column_count)
        .unwrap_or(0);
    let run = BenchmarkRun {
        run_index,
        elapsed_ms: 0,
        total_files,
        videos: 0,
        scan_ms: 0,
        columns,
        content_height: scroll.content_height(),
        layout_passes: layout_passes.get(),
        aspect_passes: aspect_passes.get(),
        layout_p50_ms: percentile_ms(&layout_times_ms, 0.50),
        layout_p95_ms: percentile_ms(&layout_times_ms, 0.95),
        frames_simulated: frame_times_ms.len(),
        frame_p50_ms: percentile_ms(&frame_times_ms, 0.50),
        frame_p95_ms: percentile_ms(&frame_times_ms, 0.95),
        frames_over_16ms: frame_times_ms.iter().filter(|ms| **ms > 16.0).count(),
        loads: loads.get(),
        elements_created: backend.created(),
        plays: plays.get(),
        anchor: grid.anchor().stats(),
    };
    info!(
        run = run_index + 1,
        virtual_ms = scheduler.elapsed().as_millis() as u64,
        "Scroll simulation finished"
    );
    grid.stop();
    Ok(run)
}

/// Backend whose elements decode instantly, with dimensions derived from the
/// tile id so repeated runs produce the same layout.
#[derive(Clone)]
struct SimulatedBackend {
    clock: Rc<ManualScheduler>,
    created: Rc<Cell<usize>>,
}

impl SimulatedBackend {
    fn new(clock: Rc<ManualScheduler>) -> Self {
        Self {
            clock,
            created: Rc::new(Cell::new(0)),
        }
    }

    fn created(&self) -> usize {
        self.created.get()
    }
}

impl MediaBackend for SimulatedBackend {
    type Element = SimulatedElement;

    fn create_element(
        &self,
        id: &TileId,
        _kind: MediaKind,
        _options: ElementOptions,
        sink: MediaEventSink,
    ) -> SimulatedElement {
        self.created.set(self.created.get() + 1);
        SimulatedElement {
            dimensions: simulated_dimensions(id),
            clock: self.clock.clone(),
            sink,
            has_source: false,
            attached: false,
            offset: 0.0,
            playing_since: None,
        }
    }
}

struct SimulatedElement {
    dimensions: (u32, u32),
    clock: Rc<ManualScheduler>,
    sink: MediaEventSink,
    has_source: bool,
    attached: bool,
    offset: f64,
    playing_since: Option<Instant>,
}

impl MediaElement for SimulatedElement {
    fn set_source(&mut self, _source: &ResolvedSource) {
        self.has_source = true;
    }

    fn clear_source(&mut self) {
        self.has_source = false;
    }

    fn load(&mut self) {
        if !self.has_source {
            return;
        }
        let (width, height) = self.dimensions;
        self.sink.emit(MediaEvent::LoadedMetadata { width, height });
        self.sink.emit(MediaEvent::FirstFrame);
    }

    fn play(&mut self) -> Result<(), MediaErrorCode> {
        if !self.has_source {
            return Err(MediaErrorCode::SourceNotSupported);
        }
        if self.playing_since.is_none() {
            self.playing_since = Some(self.clock.now());
            self.sink.emit(MediaEvent::Playing);
        }
        Ok(())
    }

    fn pause(&mut self) {
        self.offset = self.current_time();
        if self.playing_since.take().is_some() {
            self.sink.emit(MediaEvent::Paused);
        }
    }

    fn seek(&mut self, seconds: f64) {
        self.offset = seconds;
        if self.playing_since.is_some() {
            self.playing_since = Some(self.clock.now());
        }
    }

    fn current_time(&self) -> f64 {
        match self.playing_since {
            Some(since) => self.offset + self.clock.now().duration_since(since).as_secs_f64(),
            None => self.offset,
        }
    }

    fn is_paused(&self) -> bool {
        self.playing_since.is_none()
    }

    fn has_enough_data(&self) -> bool {
        self.has_source
    }

    fn attach(&mut self) {
        self.attached = true;
    }

    fn detach(&mut self) {
        self.attached = false;
    }

    fn release_decoder(&mut self) {
        self.playing_since = None;
    }

    fn is_attached(&self) -> bool {
        self.attached
    }
}

fn simulated_dimensions(id: &TileId) -> (u32, u32) {
    const SHAPES: [(u32, u32); 6] = [
        (1920, 1080),
        (1080, 1920),
        (1024, 1024),
        (1600, 1200),
        (1200, 1600),
        (2560, 1080),
    ];
    SHAPES[(xxh3_64(id.as_str().as_bytes()) % SHAPES.len() as u64) as usize]
}

fn render_report_json(report: &BenchmarkReport) -> String {
    let mut out = String::new();
    out.push_str("{\n");
    out.push_str(&format!(
        "  \"schema_version\": {},\n",
        report.schema_version
    ));
    out.push_str(&format!(
        "  \"generated_at_unix_ms\": {},\n",
        report.generated_at_unix_ms
    ));
    out.push_str(&format!("  \"path\": \"{}\",\n", escape_json(&report.path)));
    out.push_str(&format!(
        "  \"runs_requested\": {},\n",
        report.runs_requested
    ));
    out.push_str(&format!("  \"width\": {:.1},\n", report.width));
    out.push_str(&format!(
        "  \"viewport_height\": {:.1},\n",
        report.viewport_height
    ));
    out.push_str(&format!("  \"zoom\": \"{}\",\n", report.zoom));
    out.push_str("  \"runs\": [\n");
    for (i, run) in report.runs.iter().enumerate() {
        out.push_str("    {\n");
        out.push_str(&format!("      \"run_index\": {},\n", run.run_index));
        out.push_str(&format!("      \"elapsed_ms\": {},\n", run.elapsed_ms));
        out.push_str(&format!("      \"total_files\": {},\n", run.total_files));
        out.push_str(&format!("      \"videos\": {},\n", run.videos));
        out.push_str(&format!("      \"scan_ms\": {},\n", run.scan_ms));
        out.push_str(&format!("      \"columns\": {},\n", run.columns));
        out.push_str(&format!(
            "      \"content_height\": {:.1},\n",
            run.content_height
        ));
        out.push_str(&format!("      \"layout_passes\": {},\n", run.layout_passes));
        out.push_str(&format!("      \"aspect_passes\": {},\n", run.aspect_passes));
        out.push_str(&format!(
            "      \"layout_p50_ms\": {:.3},\n",
            run.layout_p50_ms
        ));
        out.push_str(&format!(
            "      \"layout_p95_ms\": {:.3},\n",
            run.layout_p95_ms
        ));
        out.push_str(&format!(
            "      \"frames_simulated\": {},\n",
            run.frames_simulated
        ));
        out.push_str(&format!("      \"frame_p50_ms\": {:.3},\n", run.frame_p50_ms));
        out.push_str(&format!("      \"frame_p95_ms\": {:.3},\n", run.frame_p95_ms));
        out.push_str(&format!(
            "      \"frames_over_16ms\": {},\n",
            run.frames_over_16ms
        ));
        out.push_str(&format!("      \"loads\": {},\n", run.loads));
        out.push_str(&format!(
            "      \"elements_created\": {},\n",
            run.elements_created
        ));
        out.push_str(&format!("      \"plays\": {},\n", run.plays));
        out.push_str(&format!(
            "      \"anchor_started\": {},\n",
            run.anchor.started
        ));
        out.push_str(&format!(
            "      \"anchor_applied\": {},\n",
            run.anchor.applied
        ));
        out.push_str(&format!(
            "      \"anchor_superseded\": {},\n",
            run.anchor.superseded
        ));
        out.push_str(&format!(
            "      \"anchor_abandoned\": {}\n",
            run.anchor.abandoned
        ));
        out.push_str("    }");
        if i + 1 < report.runs.len() {
            out.push(',');
        }
        out.push('\n');
    }
    out.push_str("  ]\n");
    out.push_str("}\n");
    out
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn percentile_ms(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let clamped = p.clamp(0.0, 1.0);
    let idx = ((sorted.len() - 1) as f64 * clamped).round() as usize;
    sorted[idx]
}

fn escape_json(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if c.is_control() => escaped.push_str(&format!("\\u{:04x}", c as u32)),
            c => escaped.push(c),
        }
    }
    escaped
}
