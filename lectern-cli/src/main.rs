use std::fs;
use std::io::{self, Stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use crossterm::cursor;
use crossterm::event::{self, DisableMouseCapture, EnableMouseCapture, Event};
use crossterm::terminal;
use directories::ProjectDirs;
use lectern_core::gesture::FRAME_INTERVAL;
use lectern_core::{
    Annotation, ColumnMode, Command, ContentRange, ContentSurface, FileStateStore, LayoutMode,
    ReaderConfig, ReaderController, ReaderEvent, StateStore, Viewport,
};
use lectern_surface::{DirectoryBookProvider, TextGridSurface};
use lectern_tty::{
    prompt_command, CellGrid, EventMapper, PageRenderer, StatusLine, UiEvent, BASE_CELL_HEIGHT,
    BASE_CELL_WIDTH,
};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

type Reader = ReaderController<TextGridSurface>;

const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Paginated,
    Scrolled,
}

impl From<ModeArg> for LayoutMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Paginated => LayoutMode::Paginated,
            ModeArg::Scrolled => LayoutMode::Scrolled,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColumnsArg {
    Auto,
    Single,
    Double,
}

impl From<ColumnsArg> for ColumnMode {
    fn from(columns: ColumnsArg) -> Self {
        match columns {
            ColumnsArg::Auto => ColumnMode::Auto,
            ColumnsArg::Single => ColumnMode::Single,
            ColumnsArg::Double => ColumnMode::Double,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "lectern",
    version,
    about = "terminal reader for unpacked EPUBs and folders of chapters"
)]
struct Args {
    /// Book directory: an unpacked EPUB or a folder of chapter files
    book: PathBuf,

    /// Layout mode, overriding the saved one
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Column layout for paginated mode
    #[arg(long, value_enum)]
    columns: Option<ColumnsArg>,

    /// Font size in surface pixels (16 fills one terminal cell per character)
    #[arg(long)]
    font_size: Option<f64>,

    /// Config file; defaults to config.toml in the platform config directory
    #[arg(long)]
    config: Option<PathBuf>,

    /// Location to open at: an href such as `ch02.xhtml#note` or `epubcfi(...)`
    #[arg(long)]
    goto: Option<String>,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, DisableMouseCapture, cursor::Show);
        let _ = terminal::disable_raw_mode();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("org", "lectern", "lectern")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| project_dirs.config_dir().join("config.toml"));
    let mut config = ReaderConfig::load(&config_path)
        .with_context(|| format!("failed to load config {:?}", config_path))?;
    let (columns, rows) = terminal::size()?;
    config.layout.viewport = viewport_for_terminal(columns, rows);

    let state_dir = project_dirs.data_local_dir().join("state");
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(state_dir)?);
    let mut reader = ReaderController::new(config, TextGridSurface::new(), store);
    reader
        .open_with(&DirectoryBookProvider::new(), &args.book)
        .await
        .with_context(|| format!("failed to open {:?}", args.book))?;
    apply_overrides(&mut reader, &args).await?;

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, EnableMouseCapture, cursor::Hide)?;
    let mut renderer = PageRenderer::new(stdout);
    renderer.clear_all()?;
    let mut event_mapper = EventMapper::new();
    let mut message: Option<String> = None;
    let mut dirty = true;
    let mut last_frame = Instant::now();

    loop {
        event_mapper.set_layout_mode(reader.mode());
        if dirty {
            let pending = event_mapper.pending_input();
            redraw(&mut renderer, &reader, pending.as_deref(), message.as_deref())?;
            dirty = false;
        }

        let timeout = if reader.gestures().is_busy() {
            FRAME_INTERVAL.saturating_sub(last_frame.elapsed())
        } else {
            IDLE_POLL
        };
        if event::poll(timeout)? {
            let action = match event::read()? {
                Event::Resize(columns, rows) => {
                    let viewport = viewport_for_terminal(columns, rows);
                    reader.resize(viewport.width, viewport.height);
                    LoopAction::ContinueRedraw
                }
                ev => {
                    let ui_event = event_mapper.map_event(ev);
                    handle_event(ui_event, &mut reader, &mut message).await?
                }
            };
            match action {
                LoopAction::ContinueRedraw => dirty = true,
                LoopAction::Continue => {}
                LoopAction::Quit => break,
            }
        }

        // input arriving faster than the frame rate is coalesced by the reader
        let now = Instant::now();
        if now.duration_since(last_frame) >= FRAME_INTERVAL {
            last_frame = now;
            match reader.poll(now).await {
                Ok(changed) => dirty |= changed,
                Err(err) => {
                    warn!(%err, "reader poll failed");
                    message = Some(err.to_string());
                    dirty = true;
                }
            }
        }
        for event in reader.drain_events() {
            match event {
                ReaderEvent::Error { kind, message: text } => {
                    warn!(?kind, %text, "reader error");
                    message = Some(text);
                    dirty = true;
                }
                ReaderEvent::Relocated(location) => debug!(?location, "relocated"),
                ReaderEvent::Loading(loading) => debug!(loading, "loading"),
                ReaderEvent::Selected { text, location, .. } => {
                    info!(%location, chars = text.chars().count(), "selected")
                }
            }
        }
    }

    renderer.clear_all()?;
    reader.close()?;
    Ok(())
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

/// Terminal cells map to surface pixels at the base cell size; the last row
/// is the status line.
fn viewport_for_terminal(columns: u16, rows: u16) -> Viewport {
    Viewport::new(
        f64::from(columns.max(1)) * BASE_CELL_WIDTH,
        f64::from(rows.saturating_sub(1).max(1)) * BASE_CELL_HEIGHT,
    )
}

async fn apply_overrides(reader: &mut Reader, args: &Args) -> Result<()> {
    if let Some(mode) = args.mode {
        reader.set_mode(mode.into()).await?;
    }
    if let Some(columns) = args.columns {
        reader.set_columns(columns.into());
    }
    if let Some(size) = args.font_size {
        reader.set_font_size(size);
    }
    if let Some(target) = args.goto.as_deref() {
        if let Some(command) = prompt_command(target) {
            reader.apply(command).await?;
        }
    }
    Ok(())
}

async fn handle_event(
    event: UiEvent,
    reader: &mut Reader,
    message: &mut Option<String>,
) -> Result<LoopAction> {
    let command = match event {
        UiEvent::Quit => return Ok(LoopAction::Quit),
        UiEvent::None => return Ok(LoopAction::Continue),
        UiEvent::BeginPrompt | UiEvent::PromptChanged { .. } | UiEvent::PromptCancel => {
            return Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::PromptSubmit { input } => match prompt_command(&input) {
            Some(command) => command,
            None => return Ok(LoopAction::ContinueRedraw),
        },
        UiEvent::NextChapter { count } => Command::GotoSpineIndex {
            index: reader.spine_index().saturating_add(count),
        },
        UiEvent::PrevChapter { count } => Command::GotoSpineIndex {
            index: reader.spine_index().saturating_sub(count),
        },
        UiEvent::HighlightLine => {
            *message = highlight_first_line(reader)?;
            return Ok(LoopAction::ContinueRedraw);
        }
        UiEvent::ClearHighlights => {
            let ids: Vec<String> = reader.annotations().iter().map(|a| a.id.clone()).collect();
            for id in &ids {
                reader.remove_annotation(id);
            }
            *message = Some(format!("removed {} highlights", ids.len()));
            return Ok(LoopAction::ContinueRedraw);
        }
        UiEvent::Command(command) => command,
    };

    *message = None;
    match reader.apply(command).await {
        Ok(true) => Ok(LoopAction::ContinueRedraw),
        Ok(false) => Ok(LoopAction::Continue),
        Err(err) => {
            warn!(%err, "command failed");
            *message = Some(err.to_string());
            Ok(LoopAction::ContinueRedraw)
        }
    }
}

/// Highlights the first line on screen and returns a status message.
fn highlight_first_line(reader: &mut Reader) -> Result<Option<String>> {
    let Some(run) = reader.surface().visible_runs().into_iter().next() else {
        return Ok(Some("nothing to highlight".into()));
    };
    let range = ContentRange::new(
        run.spine_index,
        run.start,
        run.start + run.text.chars().count(),
    );
    let selector = reader.select(range)?;
    let stamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
    let highlights = reader.add_annotation(Annotation {
        id: format!("hl-{stamp}"),
        color_tag: "yellow".into(),
        selector,
    });
    Ok(Some(format!("{} highlights", highlights.len())))
}

fn redraw(
    renderer: &mut PageRenderer<Stdout>,
    reader: &Reader,
    pending_input: Option<&str>,
    message: Option<&str>,
) -> Result<()> {
    let (columns, rows) = terminal::size()?;
    let text_rows = rows.saturating_sub(1).max(1);
    let (cell_width, line_height) = reader
        .surface()
        .cell_size()
        .unwrap_or((BASE_CELL_WIDTH, BASE_CELL_HEIGHT));
    let grid = CellGrid::new(cell_width, line_height, columns, text_rows);
    let spans = grid.highlight_spans(reader.highlights(), reader.surface().applied_offset());
    let runs = reader.surface().visible_runs();

    renderer.begin_sync_update()?;
    renderer.draw(&runs, &spans, grid)?;
    let status = StatusLine {
        title: reader
            .book()
            .and_then(|book| book.metadata.title.as_deref())
            .unwrap_or("untitled"),
        chapter_count: reader.book().map_or(0, |book| book.chapter_count()),
        mode: reader.mode(),
        location: reader.location(),
        message: pending_input.or(message),
    };
    renderer.draw_status(text_rows, columns, &status)?;
    renderer.end_sync_update()?;
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "lectern.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // the terminal is owned by the page renderer, so logs only go to the file
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_size_maps_to_base_cells() {
        let viewport = viewport_for_terminal(80, 25);
        assert_eq!(viewport, Viewport::new(640.0, 384.0));
        assert!(viewport_for_terminal(0, 0).is_measurable());
    }

    #[test]
    fn args_accept_overrides() {
        let args = Args::parse_from([
            "lectern",
            "books/sample",
            "--mode",
            "scrolled",
            "--columns",
            "double",
            "--font-size",
            "20",
        ]);
        assert!(matches!(args.mode, Some(ModeArg::Scrolled)));
        assert!(matches!(args.columns, Some(ColumnsArg::Double)));
        assert_eq!(args.font_size, Some(20.0));
        assert_eq!(args.book, PathBuf::from("books/sample"));
    }
}
