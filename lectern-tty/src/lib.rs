use std::fmt;
use std::io::{self, Write};

use anyhow::Result;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind},
    style::{Attribute, Print, SetAttribute},
    terminal::{Clear, ClearType},
    QueueableCommand,
};
use lectern_core::{AnchoredHighlight, Command, LayoutMode, Location, Translation};
use lectern_surface::TextRun;
use tracing::trace;

/// Horizontal cells in a terminal row, in surface pixels at the default font.
pub const BASE_CELL_WIDTH: f64 = 8.0;
/// Terminal row height in surface pixels at the default font.
pub const BASE_CELL_HEIGHT: f64 = 16.0;

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Command(Command),
    NextChapter { count: usize },
    PrevChapter { count: usize },
    /// Highlight the first visible line.
    HighlightLine,
    ClearHighlights,
    BeginPrompt,
    PromptChanged { input: String },
    PromptSubmit { input: String },
    PromptCancel,
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    /// Collecting an href or `epubcfi(...)` after `:`.
    Prompt,
}

#[derive(Debug)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    mode: InputMode,
    prompt_buffer: String,
    layout_mode: LayoutMode,
    drag_origin: Option<(u16, u16)>,
}

impl Default for EventMapper {
    fn default() -> Self {
        Self {
            pending_count: None,
            pending_digits: String::new(),
            mode: InputMode::Normal,
            prompt_buffer: String::new(),
            layout_mode: LayoutMode::Paginated,
            drag_origin: None,
        }
    }
}

impl EventMapper {
    pub const SCROLL_STEP: f64 = 3.0 * BASE_CELL_HEIGHT;

    pub fn new() -> Self {
        Self::default()
    }

    /// Mouse input drags along the layout axis, so the mapper follows the
    /// reader's mode.
    pub fn set_layout_mode(&mut self, mode: LayoutMode) {
        self.layout_mode = mode;
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.prompt_buffer.clear();
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        if let Event::Mouse(mouse) = event {
            return self.map_mouse(mouse);
        }
        match self.mode {
            InputMode::Normal => self.map_event_normal(event),
            InputMode::Prompt => self.map_event_prompt(event),
        }
    }

    fn map_event_normal(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };
        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Char('j'), KeyModifiers::NONE)
            | (KeyCode::Char(' '), KeyModifiers::NONE)
            | (KeyCode::Right, KeyModifiers::NONE)
            | (KeyCode::PageDown, _) => {
                let count = self.take_count();
                UiEvent::Command(Command::NextPage { count })
            }
            (KeyCode::Char('k'), KeyModifiers::NONE)
            | (KeyCode::Left, KeyModifiers::NONE)
            | (KeyCode::PageUp, _) => {
                let count = self.take_count();
                UiEvent::Command(Command::PrevPage { count })
            }
            (KeyCode::Char('J'), _) | (KeyCode::Down, KeyModifiers::NONE) => {
                let count = self.take_count() as f64;
                UiEvent::Command(Command::ScrollBy {
                    delta: Self::SCROLL_STEP * count,
                })
            }
            (KeyCode::Char('K'), _) | (KeyCode::Up, KeyModifiers::NONE) => {
                let count = self.take_count() as f64;
                UiEvent::Command(Command::ScrollBy {
                    delta: -Self::SCROLL_STEP * count,
                })
            }
            (KeyCode::Char(']'), _) => UiEvent::NextChapter {
                count: self.take_count(),
            },
            (KeyCode::Char('['), _) => UiEvent::PrevChapter {
                count: self.take_count(),
            },
            (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => {
                match self.pending_count.take() {
                    Some(page) => {
                        self.reset_count();
                        UiEvent::Command(Command::GotoPage {
                            page: page.saturating_sub(1),
                        })
                    }
                    None => UiEvent::Command(Command::GotoPercentage { percentage: 0.0 }),
                }
            }
            (KeyCode::Char('G'), _) | (KeyCode::End, _) => {
                self.reset_count();
                UiEvent::Command(Command::GotoPercentage { percentage: 100.0 })
            }
            (KeyCode::Char('%'), _) => {
                let percentage = self.pending_count.take().unwrap_or(0).min(100) as f64;
                self.reset_count();
                UiEvent::Command(Command::GotoPercentage { percentage })
            }
            (KeyCode::Char(':'), _) => {
                self.set_mode(InputMode::Prompt);
                UiEvent::BeginPrompt
            }
            (KeyCode::Char('m'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::Command(Command::ToggleMode)
            }
            (KeyCode::Char('c'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::Command(Command::CycleColumns)
            }
            (KeyCode::Char('+'), _) => {
                self.reset_count();
                UiEvent::Command(Command::ScaleFont { factor: 1.1 })
            }
            (KeyCode::Char('-'), _) => {
                self.reset_count();
                UiEvent::Command(Command::ScaleFont { factor: 0.9 })
            }
            (KeyCode::Char('a'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::HighlightLine
            }
            (KeyCode::Char('A'), _) => {
                self.reset_count();
                UiEvent::ClearHighlights
            }
            (KeyCode::Esc, _) => {
                self.reset_count();
                UiEvent::Command(Command::CancelGesture)
            }
            (KeyCode::Char('q'), _) => {
                self.reset_count();
                UiEvent::Quit
            }
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn map_event_prompt(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };
        match (code, modifiers) {
            (KeyCode::Esc, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::PromptCancel
            }
            (KeyCode::Enter, _) => {
                let input = self.prompt_buffer.trim().to_string();
                self.set_mode(InputMode::Normal);
                UiEvent::PromptSubmit { input }
            }
            (KeyCode::Backspace, _) => {
                self.prompt_buffer.pop();
                UiEvent::PromptChanged {
                    input: self.prompt_buffer.clone(),
                }
            }
            (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                self.prompt_buffer.push(c);
                UiEvent::PromptChanged {
                    input: self.prompt_buffer.clone(),
                }
            }
            _ => UiEvent::None,
        }
    }

    fn map_mouse(&mut self, mouse: MouseEvent) -> UiEvent {
        let axis_delta = |dx: i32, dy: i32, mode: LayoutMode| match mode {
            LayoutMode::Paginated => dx as f64 * BASE_CELL_WIDTH,
            LayoutMode::Scrolled => dy as f64 * BASE_CELL_HEIGHT,
        };
        match mouse.kind {
            MouseEventKind::Down(MouseButton::Left) => {
                self.drag_origin = Some((mouse.column, mouse.row));
                UiEvent::None
            }
            MouseEventKind::Drag(MouseButton::Left) => {
                let Some((column, row)) = self.drag_origin.replace((mouse.column, mouse.row))
                else {
                    return UiEvent::None;
                };
                let dx = i32::from(mouse.column) - i32::from(column);
                let dy = i32::from(mouse.row) - i32::from(row);
                let delta = axis_delta(dx, dy, self.layout_mode);
                if delta == 0.0 {
                    UiEvent::None
                } else {
                    UiEvent::Command(Command::Drag { delta })
                }
            }
            MouseEventKind::Up(MouseButton::Left) => {
                self.drag_origin = None;
                UiEvent::None
            }
            MouseEventKind::ScrollDown => self.wheel(1.0),
            MouseEventKind::ScrollUp => self.wheel(-1.0),
            _ => UiEvent::None,
        }
    }

    /// One wheel notch turns one page when paginated and scrolls otherwise.
    /// `sign` is positive toward later content.
    fn wheel(&mut self, sign: f64) -> UiEvent {
        self.reset_count();
        match self.layout_mode {
            LayoutMode::Paginated if sign > 0.0 => {
                UiEvent::Command(Command::NextPage { count: 1 })
            }
            LayoutMode::Paginated => UiEvent::Command(Command::PrevPage { count: 1 }),
            LayoutMode::Scrolled => UiEvent::Command(Command::ScrollBy {
                delta: sign * Self::SCROLL_STEP,
            }),
        }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        match self.mode {
            InputMode::Prompt => Some(format!(":{}", self.prompt_buffer)),
            InputMode::Normal if !self.pending_digits.is_empty() => {
                Some(self.pending_digits.clone())
            }
            InputMode::Normal => None,
        }
    }
}

/// Interprets prompt input as a CFI when it looks like one, otherwise as an
/// href.
pub fn prompt_command(input: &str) -> Option<Command> {
    let input = input.trim();
    if input.is_empty() {
        None
    } else if input.starts_with("epubcfi(") {
        Some(Command::GotoCfi {
            cfi: input.to_string(),
        })
    } else {
        Some(Command::GotoHref {
            href: input.to_string(),
        })
    }
}

/// A highlighted run of terminal cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSpan {
    pub row: u16,
    pub column: u16,
    pub width: u16,
}

/// Maps surface pixels onto terminal cells.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellGrid {
    pub cell_width: f64,
    pub line_height: f64,
    pub columns: u16,
    pub rows: u16,
}

impl CellGrid {
    pub fn new(cell_width: f64, line_height: f64, columns: u16, rows: u16) -> Self {
        Self {
            cell_width: cell_width.max(f64::EPSILON),
            line_height: line_height.max(f64::EPSILON),
            columns,
            rows,
        }
    }

    fn cell(&self, x: f64, y: f64) -> Option<(u16, u16)> {
        let column = (x / self.cell_width).round();
        let row = (y / self.line_height).round();
        if column < 0.0 || row < 0.0 || column >= self.columns as f64 || row >= self.rows as f64 {
            return None;
        }
        Some((row as u16, column as u16))
    }

    /// Cells covered by renderable highlights. Highlight rects are in content
    /// space; `applied` is the surface translation that brings them on screen.
    pub fn highlight_spans(
        &self,
        highlights: &[AnchoredHighlight],
        applied: Translation,
    ) -> Vec<CellSpan> {
        highlights
            .iter()
            .filter(|highlight| highlight.is_renderable())
            .flat_map(|highlight| highlight.rects.iter())
            .filter_map(|rect| {
                let rect = rect.translate(applied.x, applied.y);
                let (row, column) = self.cell(rect.x, rect.y)?;
                let width = (rect.width / self.cell_width).round() as u16;
                let width = width.min(self.columns - column);
                (width > 0).then_some(CellSpan { row, column, width })
            })
            .collect()
    }
}

/// Paints the visible text grid, highlight markers and a status line.
pub struct PageRenderer<W: Write> {
    writer: W,
}

impl<W: Write> PageRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn draw(&mut self, runs: &[TextRun], spans: &[CellSpan], grid: CellGrid) -> Result<()> {
        trace!(runs = runs.len(), spans = spans.len(), "drawing page");
        self.writer.queue(Clear(ClearType::All))?;
        for run in runs {
            let Some((row, column)) = grid.cell(run.x, run.y) else {
                continue;
            };
            let room = usize::from(grid.columns - column);
            let chars: Vec<char> = run.text.chars().take(room).collect();
            let marked: Vec<bool> = (0..chars.len())
                .map(|i| {
                    let at = column + i as u16;
                    spans.iter().any(|span| {
                        span.row == row && at >= span.column && at < span.column + span.width
                    })
                })
                .collect();

            self.writer.queue(cursor::MoveTo(column, row))?;
            let mut start = 0;
            while start < chars.len() {
                let highlighted = marked[start];
                let end = (start..chars.len())
                    .find(|&i| marked[i] != highlighted)
                    .unwrap_or(chars.len());
                let segment: String = chars[start..end].iter().collect();
                if highlighted {
                    self.writer
                        .queue(SetAttribute(Attribute::Reverse))?
                        .queue(Print(segment))?
                        .queue(SetAttribute(Attribute::NoReverse))?;
                } else {
                    self.writer.queue(Print(segment))?;
                }
                start = end;
            }
        }
        Ok(())
    }

    pub fn draw_status(&mut self, row: u16, width: u16, status: &StatusLine<'_>) -> Result<()> {
        self.writer
            .queue(cursor::MoveTo(0, row))?
            .queue(Clear(ClearType::CurrentLine))?;
        write_status_line(&mut self.writer, status, width)?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// Disables synchronized updates.
    /// The terminal will render all buffered changes at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

/// Bottom-row summary of the reading position.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLine<'a> {
    pub title: &'a str,
    pub chapter_count: usize,
    pub mode: LayoutMode,
    /// `None` until the surface has been measured.
    pub location: Option<Location>,
    /// Pending count, prompt input or the latest error.
    pub message: Option<&'a str>,
}

impl fmt::Display for StatusLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title)?;
        match &self.location {
            Some(location) => write!(
                f,
                " | ch {}/{} | p {}/{} | {:.0}%",
                location.spine_index + 1,
                self.chapter_count,
                location.page_in_chapter + 1,
                location.total_pages_in_chapter,
                location.percentage,
            )?,
            None => f.write_str(" | laying out")?,
        }
        f.write_str(match self.mode {
            LayoutMode::Paginated => " | paged",
            LayoutMode::Scrolled => " | scroll",
        })?;
        if let Some(message) = self.message.filter(|message| !message.is_empty()) {
            write!(f, " | {message}")?;
        }
        Ok(())
    }
}

/// Writes the status summary, cut to `width` cells.
pub fn write_status_line<W: Write>(
    writer: &mut W,
    status: &StatusLine<'_>,
    width: u16,
) -> io::Result<()> {
    let label: String = status.to_string().chars().take(usize::from(width)).collect();
    writer.queue(Print(label))?;
    writer.flush()
}
