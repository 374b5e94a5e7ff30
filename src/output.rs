use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossterm::cursor::MoveToColumn;
use crossterm::queue;
use crossterm::style::Print;
use crossterm::terminal::{self, Clear, ClearType};
use serde::Serialize;

use crate::acquire::AcquireReport;
use crate::app::{AnalyzeResult, CreateResult, InfoResult, ListResult, RemoveResult};
use crate::progress::{ProgressEvent, ProgressSink, TaskId};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_info(result: &InfoResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_create(result: &CreateResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_download(result: &AcquireReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_remove(result: &RemoveResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_analyze(result: &AnalyzeResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

const REDRAW_EVERY: Duration = Duration::from_millis(80);

#[derive(Debug)]
struct TaskLine {
    description: String,
    total: Option<u64>,
    completed: u64,
}

struct TerminalState {
    tasks: BTreeMap<TaskId, TaskLine>,
    last_draw: Option<Instant>,
}

/// Single status line on stderr: the oldest live task (the overall counter)
/// plus the most recently started one.
pub struct TerminalSink {
    state: Mutex<TerminalState>,
}

impl Default for TerminalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalSink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TerminalState {
                tasks: BTreeMap::new(),
                last_draw: None,
            }),
        }
    }

    fn render(tasks: &BTreeMap<TaskId, TaskLine>) -> String {
        let mut parts = Vec::new();
        if let Some(first) = tasks.values().next() {
            parts.push(format_task(first));
        }
        if tasks.len() > 1 {
            if let Some(last) = tasks.values().next_back() {
                parts.push(format!("{} active | {}", tasks.len() - 1, last.description));
            }
        }
        parts.join(" | ")
    }

    fn draw(line: &str) -> io::Result<()> {
        let width = terminal::size().map(|(cols, _)| cols as usize).unwrap_or(120);
        let clipped: String = line.chars().take(width.saturating_sub(1)).collect();
        let mut stderr = io::stderr();
        queue!(
            stderr,
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(clipped)
        )?;
        stderr.flush()
    }
}

fn format_task(task: &TaskLine) -> String {
    match task.total {
        Some(total) => format!("[{}/{}] {}", task.completed, total, task.description),
        None => format!("[{}] {}", task.completed, task.description),
    }
}

impl ProgressSink for TerminalSink {
    fn event(&self, event: ProgressEvent) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let force = !matches!(event, ProgressEvent::Advanced { .. });
        match event {
            ProgressEvent::Started {
                task,
                description,
                total,
                completed,
            } => {
                state.tasks.insert(
                    task,
                    TaskLine {
                        description,
                        total,
                        completed,
                    },
                );
            }
            ProgressEvent::Advanced {
                task,
                advance,
                description,
            } => {
                if let Some(line) = state.tasks.get_mut(&task) {
                    line.completed += advance;
                    if let Some(description) = description {
                        line.description = description;
                    }
                }
            }
            ProgressEvent::Finished { task } => {
                state.tasks.remove(&task);
            }
        }

        let now = Instant::now();
        let due = state
            .last_draw
            .is_none_or(|last| now.duration_since(last) >= REDRAW_EVERY);
        if !force && !due {
            return;
        }
        state.last_draw = Some(now);
        let line = Self::render(&state.tasks);
        let _ = Self::draw(&line);
    }
}
