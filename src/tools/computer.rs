use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use super::{ToolError, ToolResult, ToolVersion};

const TYPING_CHUNK: usize = 50;
const TYPING_DELAY_MS: &str = "12";
const SCREENSHOT_DELAY: Duration = Duration::from_secs(2);
const MAX_WAIT_SECS: f64 = 100.0;

/// Geometry of the X display the computer tool drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplaySettings {
    pub width: u32,
    pub height: u32,
    pub display_num: Option<u32>,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
            display_num: Some(1),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ComputerInput {
    action: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    coordinate: Option<Vec<i64>>,
    #[serde(default)]
    scroll_direction: Option<String>,
    #[serde(default)]
    scroll_amount: Option<i64>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    key: Option<String>,
}

pub(super) struct ComputerTool {
    version: ToolVersion,
    display: DisplaySettings,
    screenshot_dir: PathBuf,
}

impl ComputerTool {
    pub(super) fn new(version: ToolVersion, display: DisplaySettings) -> Self {
        Self {
            version,
            display,
            screenshot_dir: std::env::temp_dir().join("outputs"),
        }
    }

    pub(super) fn api_spec(&self, tool_type: &str) -> serde_json::Value {
        let mut spec = serde_json::json!({
            "type": tool_type,
            "name": "computer",
            "display_width_px": self.display.width,
            "display_height_px": self.display.height,
        });
        if let Some(num) = self.display.display_num {
            spec["display_number"] = num.into();
        }
        spec
    }

    fn supports(&self, action: &str) -> bool {
        const BASE: &[&str] = &[
            "key",
            "type",
            "mouse_move",
            "left_click",
            "left_click_drag",
            "right_click",
            "middle_click",
            "double_click",
            "screenshot",
            "cursor_position",
        ];
        const EXTENDED: &[&str] = &[
            "scroll",
            "triple_click",
            "hold_key",
            "wait",
            "left_mouse_down",
            "left_mouse_up",
        ];
        BASE.contains(&action)
            || (self.version != ToolVersion::V20241022 && EXTENDED.contains(&action))
    }

    pub(super) async fn run(&self, input: serde_json::Value) -> Result<ToolResult, ToolError> {
        let input: ComputerInput = serde_json::from_value(input)
            .map_err(|e| ToolError::InvalidInput(format!("invalid computer input: {e}")))?;
        let action = input.action.as_str();
        if !self.supports(action) {
            return Err(ToolError::Unsupported(format!("Invalid action: {action}")));
        }
        tracing::debug!(action, "computer action");

        match action {
            "screenshot" => self.screenshot().await,
            "cursor_position" => {
                let out = self.xdotool(&["getmouselocation", "--shell"]).await?;
                let (x, y) = parse_mouse_location(&out).ok_or_else(|| ToolError::Command {
                    program: "xdotool".to_string(),
                    stderr: format!("unexpected getmouselocation output: {out}"),
                })?;
                Ok(ToolResult::output(format!("X={x},Y={y}")))
            }
            "key" => {
                let text = required_text(&input, action)?;
                self.xdotool(&["key", "--", text]).await?;
                self.screenshot_after_delay(None).await
            }
            "type" => {
                let text = required_text(&input, action)?;
                let chars: Vec<char> = text.chars().collect();
                for chunk in chars.chunks(TYPING_CHUNK) {
                    let chunk: String = chunk.iter().collect();
                    self.xdotool(&["type", "--delay", TYPING_DELAY_MS, "--", &chunk])
                        .await?;
                }
                self.screenshot_after_delay(None).await
            }
            "mouse_move" | "left_click_drag" => {
                let (x, y) = self.required_coordinate(&input, action)?;
                let (x, y) = (x.to_string(), y.to_string());
                if action == "mouse_move" {
                    self.xdotool(&["mousemove", "--sync", &x, &y]).await?;
                } else {
                    self.xdotool(&["mousedown", "1", "mousemove", "--sync", &x, &y, "mouseup", "1"])
                        .await?;
                }
                self.screenshot_after_delay(None).await
            }
            "left_click" | "right_click" | "middle_click" | "double_click" | "triple_click" => {
                let (button, repeat) = match action {
                    "left_click" => ("1", "1"),
                    "right_click" => ("3", "1"),
                    "middle_click" => ("2", "1"),
                    "double_click" => ("1", "2"),
                    _ => ("1", "3"),
                };
                self.move_to_optional(&input).await?;
                let modifier = input.key.as_deref().or(input.text.as_deref());
                if let Some(key) = modifier {
                    self.xdotool(&["keydown", key]).await?;
                }
                self.xdotool(&["click", "--repeat", repeat, "--delay", "10", button])
                    .await?;
                if let Some(key) = modifier {
                    self.xdotool(&["keyup", key]).await?;
                }
                self.screenshot_after_delay(None).await
            }
            "left_mouse_down" | "left_mouse_up" => {
                if input.coordinate.is_some() {
                    return Err(ToolError::InvalidInput(format!(
                        "coordinate is not accepted for {action}"
                    )));
                }
                let verb = if action == "left_mouse_down" {
                    "mousedown"
                } else {
                    "mouseup"
                };
                self.xdotool(&[verb, "1"]).await?;
                self.screenshot_after_delay(None).await
            }
            "scroll" => {
                let direction = input.scroll_direction.as_deref().unwrap_or_default();
                let button = match direction {
                    "up" => "4",
                    "down" => "5",
                    "left" => "6",
                    "right" => "7",
                    other => {
                        return Err(ToolError::InvalidInput(format!(
                            "scroll_direction={other} must be 'up', 'down', 'left', or 'right'"
                        )));
                    }
                };
                let amount = input.scroll_amount.filter(|a| *a >= 0).ok_or_else(|| {
                    ToolError::InvalidInput("scroll_amount must be a non-negative int".to_string())
                })?;
                self.move_to_optional(&input).await?;
                let amount = amount.to_string();
                if let Some(key) = input.text.as_deref() {
                    self.xdotool(&["keydown", key]).await?;
                }
                self.xdotool(&["click", "--repeat", &amount, button]).await?;
                if let Some(key) = input.text.as_deref() {
                    self.xdotool(&["keyup", key]).await?;
                }
                self.screenshot_after_delay(None).await
            }
            "hold_key" => {
                let text = required_text(&input, action)?;
                let duration = required_duration(&input)?;
                self.xdotool(&["keydown", text]).await?;
                tokio::time::sleep(duration).await;
                self.xdotool(&["keyup", text]).await?;
                self.screenshot_after_delay(None).await
            }
            "wait" => {
                let duration = required_duration(&input)?;
                self.screenshot_after_delay(Some(duration)).await
            }
            other => Err(ToolError::Unsupported(format!("Invalid action: {other}"))),
        }
    }

    fn required_coordinate(
        &self,
        input: &ComputerInput,
        action: &str,
    ) -> Result<(u32, u32), ToolError> {
        let coordinate = input
            .coordinate
            .as_deref()
            .ok_or_else(|| ToolError::InvalidInput(format!("coordinate is required for {action}")))?;
        self.validate_coordinate(coordinate)
    }

    fn validate_coordinate(&self, coordinate: &[i64]) -> Result<(u32, u32), ToolError> {
        let [x, y] = coordinate else {
            return Err(ToolError::InvalidInput(format!(
                "{coordinate:?} must be a tuple of length 2"
            )));
        };
        let in_bounds = |v: i64, max: u32| u32::try_from(v).ok().filter(|v| *v < max);
        match (
            in_bounds(*x, self.display.width),
            in_bounds(*y, self.display.height),
        ) {
            (Some(x), Some(y)) => Ok((x, y)),
            _ => Err(ToolError::InvalidInput(format!(
                "Coordinates {x}, {y} are out of bounds"
            ))),
        }
    }

    async fn move_to_optional(&self, input: &ComputerInput) -> Result<(), ToolError> {
        if let Some(coordinate) = input.coordinate.as_deref() {
            let (x, y) = self.validate_coordinate(coordinate)?;
            self.xdotool(&["mousemove", "--sync", &x.to_string(), &y.to_string()])
                .await?;
        }
        Ok(())
    }

    async fn screenshot_after_delay(&self, delay: Option<Duration>) -> Result<ToolResult, ToolError> {
        tokio::time::sleep(delay.unwrap_or(SCREENSHOT_DELAY)).await;
        self.screenshot().await
    }

    async fn screenshot(&self) -> Result<ToolResult, ToolError> {
        tokio::fs::create_dir_all(&self.screenshot_dir).await?;
        let path = self
            .screenshot_dir
            .join(format!("screenshot_{}.png", Uuid::new_v4().simple()));
        let path_arg = path.to_string_lossy().to_string();
        self.command("scrot", &["-p", "-o", &path_arg]).await?;

        let bytes = tokio::fs::read(&path).await?;
        let _ = tokio::fs::remove_file(&path).await;
        Ok(ToolResult::default().with_image(STANDARD.encode(bytes)))
    }

    async fn xdotool(&self, args: &[&str]) -> Result<String, ToolError> {
        self.command("xdotool", args).await
    }

    async fn command(&self, program: &str, args: &[&str]) -> Result<String, ToolError> {
        let mut command = tokio::process::Command::new(program);
        command.args(args).kill_on_drop(true);
        if let Some(num) = self.display.display_num {
            command.env("DISPLAY", format!(":{num}"));
        }

        let output = command.output().await.map_err(|e| ToolError::Command {
            program: program.to_string(),
            stderr: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(ToolError::Command {
                program: program.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn required_text<'a>(input: &'a ComputerInput, action: &str) -> Result<&'a str, ToolError> {
    input
        .text
        .as_deref()
        .ok_or_else(|| ToolError::InvalidInput(format!("text is required for {action}")))
}

fn required_duration(input: &ComputerInput) -> Result<Duration, ToolError> {
    match input.duration {
        Some(d) if (0.0..=MAX_WAIT_SECS).contains(&d) => Ok(Duration::from_secs_f64(d)),
        Some(_) => Err(ToolError::InvalidInput(format!(
            "duration must be between 0 and {MAX_WAIT_SECS}"
        ))),
        None => Err(ToolError::InvalidInput("duration is required".to_string())),
    }
}

fn parse_mouse_location(out: &str) -> Option<(i64, i64)> {
    let mut x = None;
    let mut y = None;
    for line in out.lines() {
        if let Some(v) = line.strip_prefix("X=") {
            x = v.trim().parse().ok();
        } else if let Some(v) = line.strip_prefix("Y=") {
            y = v.trim().parse().ok();
        }
    }
    Some((x?, y?))
}
