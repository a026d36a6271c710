use anyhow::{anyhow, bail, Context, Result};
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use lib_stream::{StreamClient, VirtualElement};

pub const HELP: &str = "\
commands:
  scroll <top> <left>      move the viewport
  resize <width> <height>  change the viewport size
  track <page>             switch the tracked page
  show                     content intersecting the viewport
  progress                 running operations
  packs                    registered widget packs
  resolve <pack@component> load a widget
  refresh                  drop cached sections and re-request
  help                     this text
  quit                     exit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Scroll { top: f64, left: f64 },
    Resize { width: f64, height: f64 },
    Track(String),
    Show,
    Progress,
    Packs,
    Resolve(String),
    Refresh,
    Help,
    Quit,
}

fn number(arg: Option<&str>, name: &str) -> Result<f64> {
    let raw = arg.ok_or_else(|| anyhow!("missing <{name}>"))?;
    let value: f64 = raw.parse().with_context(|| format!("<{name}> is not a number: {raw}"))?;
    if !value.is_finite() {
        bail!("<{name}> must be finite");
    }
    Ok(value)
}

impl FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            bail!("empty command");
        };

        let command = match verb.to_lowercase().as_str() {
            "scroll" => ConsoleCommand::Scroll {
                top: number(parts.next(), "top")?,
                left: match parts.next() {
                    Some(raw) => number(Some(raw), "left")?,
                    None => 0.0,
                },
            },
            "resize" => {
                let width = number(parts.next(), "width")?;
                let height = number(parts.next(), "height")?;
                if width <= 0.0 || height <= 0.0 {
                    bail!("viewport size must be positive");
                }
                ConsoleCommand::Resize { width, height }
            }
            "track" => ConsoleCommand::Track(parts.next().ok_or_else(|| anyhow!("missing <page>"))?.to_string()),
            "show" => ConsoleCommand::Show,
            "progress" => ConsoleCommand::Progress,
            "packs" => ConsoleCommand::Packs,
            "resolve" => ConsoleCommand::Resolve(
                parts
                    .next()
                    .ok_or_else(|| anyhow!("missing <pack@component>"))?
                    .to_string(),
            ),
            "refresh" => ConsoleCommand::Refresh,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" | "q" => ConsoleCommand::Quit,
            other => bail!("unknown command '{other}', try 'help'"),
        };
        Ok(command)
    }
}

pub enum Reply {
    Output(String),
    Quit,
}

/// Drives one headless viewport of a `StreamClient` from text commands.
pub struct Console<'a> {
    client: &'a StreamClient,
    element: Arc<VirtualElement>,
    page_id: String,
}

impl<'a> Console<'a> {
    /// Starts tracking `page_id` with `element`.
    pub fn new(client: &'a StreamClient, element: Arc<VirtualElement>, page_id: &str) -> Self {
        client.tracker().start_tracking(page_id, element.clone());
        Self {
            client,
            element,
            page_id: page_id.to_string(),
        }
    }

    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    pub async fn execute(&mut self, command: ConsoleCommand) -> Result<Reply> {
        let mut out = String::new();
        match command {
            ConsoleCommand::Scroll { top, left } => {
                self.element.scroll_to(top, left);
                writeln!(out, "scrolled to top={top} left={left}")?;
            }
            ConsoleCommand::Resize { width, height } => {
                self.element.resize(width, height);
                writeln!(out, "resized to {width}x{height}")?;
            }
            ConsoleCommand::Track(page_id) => {
                self.client.tracker().stop_tracking(&self.page_id);
                self.element.scroll_to(0.0, 0.0);
                self.client.tracker().start_tracking(&page_id, self.element.clone());
                writeln!(out, "tracking '{page_id}'")?;
                self.page_id = page_id;
            }
            ConsoleCommand::Show => self.show(&mut out)?,
            ConsoleCommand::Progress => {
                let entries = self.client.store().progress_entries();
                if entries.is_empty() {
                    writeln!(out, "no running operations")?;
                }
                for entry in entries {
                    writeln!(out, "{}/{} {:>5.1}% {}", entry.operation, entry.id, entry.percent, entry.label)?;
                }
            }
            ConsoleCommand::Packs => {
                let widgets = self.client.widgets();
                let packs = widgets.pack_ids();
                if packs.is_empty() {
                    writeln!(out, "no widget packs registered")?;
                }
                for pack in packs {
                    writeln!(out, "{}: {}", pack, widgets.components(&pack).join(", "))?;
                }
            }
            ConsoleCommand::Resolve(reference) => {
                let unit = self.client.widgets().resolve_widget(&reference).resolve().await;
                match unit.component() {
                    Some(component) => writeln!(
                        out,
                        "{} ready (path: {}, {} bytes of source)",
                        component.reference(),
                        component.path.as_deref().unwrap_or("-"),
                        component.source.as_ref().map_or(0, String::len)
                    )?,
                    None => writeln!(out, "{reference}: {}", describe(&unit))?,
                }
            }
            ConsoleCommand::Refresh => match self.client.tracker().refresh(&self.page_id) {
                Some(event) => writeln!(out, "refreshed '{}', section {} requested={}", self.page_id, event.section, event.requested)?,
                None => writeln!(out, "'{}' is not tracked", self.page_id)?,
            },
            ConsoleCommand::Help => writeln!(out, "{HELP}")?,
            ConsoleCommand::Quit => return Ok(Reply::Quit),
        }
        Ok(Reply::Output(out))
    }

    fn show(&self, out: &mut String) -> Result<()> {
        let tracker = self.client.tracker();
        match tracker.last_bounds(&self.page_id) {
            Some(b) => writeln!(
                out,
                "page '{}' viewport top={} bottom={} left={} right={}",
                self.page_id, b.top, b.bottom, b.left, b.right
            )?,
            None => writeln!(out, "page '{}' has no viewport yet", self.page_id)?,
        }

        if let Some(stream) = self.client.store().get_page_stream(&self.page_id) {
            writeln!(
                out,
                "{} sections cached, complete={}, layout {}x{}",
                stream.len(),
                stream.complete,
                stream.total_width,
                stream.total_height
            )?;
        }

        let content = tracker.get_viewport_content(&self.page_id);
        writeln!(out, "{} modules, {} widgets in view", content.modules.len(), content.widgets.len())?;
        for module in &content.modules {
            writeln!(out, "  module {}", item_label(module))?;
        }
        for widget in &content.widgets {
            writeln!(out, "  widget {}", item_label(widget))?;
        }
        Ok(())
    }
}

fn describe(unit: &lib_stream::RenderUnit) -> String {
    match unit {
        lib_stream::RenderUnit::Error { reason, .. } => format!("error: {reason}"),
        other => other.kind().to_string(),
    }
}

fn item_label(item: &serde_json::Value) -> String {
    let id = item.get("id").map(|id| id.to_string()).unwrap_or_else(|| "?".to_string());
    match item.get("ref").and_then(serde_json::Value::as_str) {
        Some(reference) => format!("{id} ({reference})"),
        None => id,
    }
}
