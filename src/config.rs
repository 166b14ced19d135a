use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

/// "HH:MM" (24時間表記・分解像度) の検証用パターン
const TIME_PATTERN: &str = r"^([0-1]?[0-9]|2[0-3]):([0-5][0-9])$";

/// カメラ1台分の設定
///
/// ロード後は不変。ワーカーが所有する。
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// カメラ識別子
    pub id: u32,
    /// 映像ソース（デバイス番号 or URL/パス）
    pub video_url: String,
    /// 在室検知時のデフォルト通知先
    pub api_url: String,
    /// 検出対象領域 [x, y, width, height]
    pub roi: [i32; 4],
    /// スナップショットに補正後フレームを使うか
    #[serde(default = "default_snapshot_enhanced")]
    pub snapshot_enhanced: bool,
}

fn default_snapshot_enhanced() -> bool {
    true
}

/// 稼働時間帯（0時からの分数、end < start で日跨ぎ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingWindow {
    pub start_min: u16,
    pub end_min: u16,
}

impl WorkingWindow {
    /// "HH:MM" 2つから構築。形式不正はロード時の致命的エラー。
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Ok(Self {
            start_min: parse_time(start)?,
            end_min: parse_time(end)?,
        })
    }

    /// 指定時刻（0時からの分数）が稼働時間帯に入るか
    pub fn contains(&self, minute_of_day: u16) -> bool {
        let (start, end) = (self.start_min, self.end_min);
        if start <= end {
            // 日中レンジ
            minute_of_day >= start && minute_of_day < end
        } else {
            // 日跨ぎレンジ
            minute_of_day >= start || minute_of_day < end
        }
    }

    /// ローカル時刻で現在開いているか
    pub fn is_open_now(&self) -> bool {
        use chrono::Timelike;
        let now = chrono::Local::now();
        self.contains((now.hour() * 60 + now.minute()) as u16)
    }
}

/// "HH:MM" を0時からの分数に変換
fn parse_time(text: &str) -> Result<u16> {
    let re = Regex::new(TIME_PATTERN).expect("time pattern is valid");
    let caps = match re.captures(text) {
        Some(caps) => caps,
        None => bail!("Invalid time format: {:?} (expected HH:MM)", text),
    };
    let hours: u16 = caps[1].parse()?;
    let minutes: u16 = caps[2].parse()?;
    Ok(hours * 60 + minutes)
}

/// ジェスチャー認識バックエンドの選択
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GestureBackend {
    /// ポーズ+手+分類器をローカルONNXで実行
    Local,
    /// ポーズはローカル、手の詳細判定はリモート
    PoseRemote,
    /// クロップ全体をリモートへ委譲
    Remote,
}

impl Default for GestureBackend {
    fn default() -> Self {
        Self::Local
    }
}

/// ONNXモデルファイルのパス
#[derive(Debug, Clone, Deserialize)]
pub struct ModelPaths {
    /// 人物検出モデル (YOLOv8)
    pub detector: String,
    /// 体ポーズモデル (YOLO-pose, 17点)
    #[serde(default)]
    pub body_pose: Option<String>,
    /// 手ポーズモデル (21点)
    #[serde(default)]
    pub hand_pose: Option<String>,
    /// 特徴ベクトル分類器
    #[serde(default)]
    pub classifier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawWorkingHours {
    start_time: String,
    end_time: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    cameras: Vec<CameraConfig>,
    #[serde(default)]
    gesture_actions: HashMap<String, String>,
    working_hours: RawWorkingHours,
    models: ModelPaths,
    #[serde(default)]
    gesture_backend: GestureBackend,
    #[serde(default = "default_recognize_url")]
    recognize_url: String,
}

fn default_recognize_url() -> String {
    "http://127.0.0.1:5001/recognize".to_string()
}

/// 検証済みのシステム設定
///
/// グローバルシングルトンにはせず、Arcで各ワーカーに明示的に渡す。
#[derive(Debug)]
pub struct Config {
    pub cameras: Vec<CameraConfig>,
    pub gesture_actions: HashMap<String, String>,
    pub working_hours: WorkingWindow,
    pub models: ModelPaths,
    pub gesture_backend: GestureBackend,
    pub recognize_url: String,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        Self::parse(&content)
    }

    /// JSON文字列から構築し、検証する
    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawConfig =
            serde_json::from_str(content).context("failed to parse config JSON")?;

        if raw.cameras.is_empty() {
            bail!("config contains no cameras");
        }
        for cam in &raw.cameras {
            let [_, _, w, h] = cam.roi;
            if w <= 0 || h <= 0 {
                bail!("camera {}: ROI has non-positive size", cam.id);
            }
        }

        let working_hours = WorkingWindow::parse(
            &raw.working_hours.start_time,
            &raw.working_hours.end_time,
        )
        .context("invalid working_hours")?;

        // ローカルバックエンドは3モデル全て必須
        if raw.gesture_backend == GestureBackend::Local {
            if raw.models.body_pose.is_none()
                || raw.models.hand_pose.is_none()
                || raw.models.classifier.is_none()
            {
                bail!("gesture_backend \"local\" requires body_pose, hand_pose and classifier model paths");
            }
        }
        if raw.gesture_backend == GestureBackend::PoseRemote && raw.models.body_pose.is_none() {
            bail!("gesture_backend \"pose_remote\" requires a body_pose model path");
        }

        Ok(Self {
            cameras: raw.cameras,
            gesture_actions: raw.gesture_actions,
            working_hours,
            models: raw.models,
            gesture_backend: raw.gesture_backend,
            recognize_url: raw.recognize_url,
        })
    }

    /// ジェスチャー名に対応する通知先URL
    pub fn gesture_url(&self, name: &str) -> Option<&str> {
        self.gesture_actions.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_valid() {
        assert_eq!(parse_time("00:00").unwrap(), 0);
        assert_eq!(parse_time("7:05").unwrap(), 7 * 60 + 5);
        assert_eq!(parse_time("23:59").unwrap(), 23 * 60 + 59);
    }

    #[test]
    fn test_parse_time_invalid() {
        assert!(parse_time("24:00").is_err());
        assert!(parse_time("7:5").is_err());
        assert!(parse_time("12:60").is_err());
        assert!(parse_time("xx:yy").is_err());
        assert!(parse_time("").is_err());
    }

    #[test]
    fn test_window_daytime() {
        // 08:00〜18:00
        let w = WorkingWindow::parse("08:00", "18:00").unwrap();
        assert!(w.contains(12 * 60));
        assert!(!w.contains(20 * 60));
        // 開始は含む、終了は含まない
        assert!(w.contains(8 * 60));
        assert!(!w.contains(18 * 60));
    }

    #[test]
    fn test_window_wraparound() {
        // 22:00〜06:00（日跨ぎ）
        let w = WorkingWindow::parse("22:00", "06:00").unwrap();
        assert!(w.contains(23 * 60 + 30));
        assert!(!w.contains(7 * 60));
        assert!(w.contains(2 * 60));
        assert!(w.contains(22 * 60));
        assert!(!w.contains(6 * 60));
    }

    const SAMPLE: &str = r#"{
        "cameras": [
            {"id": 1, "video_url": "0", "api_url": "http://hub/on", "roi": [0, 0, 640, 480]}
        ],
        "gesture_actions": {
            "system_on": "http://hub/auto",
            "system_off": "http://hub/manual"
        },
        "working_hours": {"start_time": "08:00", "end_time": "18:00"},
        "models": {
            "detector": "models/person.onnx",
            "body_pose": "models/body.onnx",
            "hand_pose": "models/hand.onnx",
            "classifier": "models/gesture.onnx"
        }
    }"#;

    #[test]
    fn test_parse_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.cameras.len(), 1);
        assert_eq!(config.cameras[0].roi, [0, 0, 640, 480]);
        assert!(config.cameras[0].snapshot_enhanced);
        assert_eq!(config.gesture_backend, GestureBackend::Local);
        assert_eq!(config.gesture_url("system_on"), Some("http://hub/auto"));
        assert_eq!(config.gesture_url("peace"), None);
    }

    #[test]
    fn test_parse_config_bad_time_is_fatal() {
        let bad = SAMPLE.replace("08:00", "25:00");
        assert!(Config::parse(&bad).is_err());
    }

    #[test]
    fn test_parse_config_local_requires_models() {
        let bad = SAMPLE.replace("\"body_pose\": \"models/body.onnx\",", "");
        assert!(Config::parse(&bad).is_err());
    }
}
