use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{error, info, warn};
use opencv::{
    core::{Mat, Rect},
    prelude::*,
};

use crate::actuate::Trigger;
use crate::capture::VideoSource;
use crate::config::{CameraConfig, WorkingWindow};
use crate::detect::{clamp_rect, PersonDetector};
use crate::enhance::enhance;
use crate::gesture::{GestureClassifier, GestureLabel};
use crate::mode::{SharedMode, SystemMode};

/// ジェスチャー確定に必要な連続一致フレーム数
pub const CONFIRMATION_THRESHOLD: u32 = 3;

/// 退化BBoxとみなす最小辺長
const MIN_BOX_SIDE: i32 = 2;

/// ワーカーの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

/// ループのタイミング設定
///
/// 本番はDefaultの値を使う。テストでは短縮して注入する。
#[derive(Debug, Clone)]
pub struct WorkerTimings {
    /// フレーム間の休止
    pub frame_pause: Duration,
    /// 再接続までのバックオフ
    pub reconnect_backoff: Duration,
    /// 停止フラグのポーリング間隔
    pub stop_poll: Duration,
    /// 稼働時間外の休止
    pub off_hours_pause: Duration,
    /// 自動発火のクールダウン
    pub cooldown: Duration,
}

impl Default for WorkerTimings {
    fn default() -> Self {
        Self {
            frame_pause: Duration::from_millis(30),
            reconnect_backoff: Duration::from_secs(5),
            stop_poll: Duration::from_millis(100),
            off_hours_pause: Duration::from_secs(60),
            cooldown: Duration::from_secs(5),
        }
    }
}

/// 検出・分類のまとめ口
///
/// ワーカー本体を推論実装から切り離す（テストではスタブを注入）。
pub trait Perception: Send {
    fn detect_persons(&mut self, frame: &Mat) -> Result<Vec<Rect>>;
    fn classify_gesture(&mut self, crop: &Mat) -> Result<GestureLabel>;
}

/// 全ワーカーで共有するモデル群
///
/// ortセッションの並行呼び出し安全性は未確認のため、Mutexで明示的に
/// 直列化する。呼び出しは読み取り専用の推論のみ。
pub struct SharedPerception {
    detector: Arc<Mutex<PersonDetector>>,
    classifier: Arc<Mutex<Box<dyn GestureClassifier + Send>>>,
}

impl SharedPerception {
    pub fn new(
        detector: Arc<Mutex<PersonDetector>>,
        classifier: Arc<Mutex<Box<dyn GestureClassifier + Send>>>,
    ) -> Self {
        Self {
            detector,
            classifier,
        }
    }
}

impl Perception for SharedPerception {
    fn detect_persons(&mut self, frame: &Mat) -> Result<Vec<Rect>> {
        self.detector.lock().unwrap().detect(frame)
    }

    fn classify_gesture(&mut self, crop: &Mat) -> Result<GestureLabel> {
        self.classifier.lock().unwrap().recognize(crop)
    }
}

/// 確定ヒステリシス
///
/// 同じ非NONEラベルが閾値回連続したときだけ確定する。不一致時は
/// カウンタを1にして新しいラベルの1回目として数え直す（0には戻さない）。
#[derive(Debug)]
pub struct GestureHysteresis {
    last: GestureLabel,
    count: u32,
    threshold: u32,
}

impl GestureHysteresis {
    pub fn new(threshold: u32) -> Self {
        Self {
            last: GestureLabel::None,
            count: 0,
            threshold,
        }
    }

    /// 1フレーム分の分類結果を観測し、確定したらそのラベルを返す
    pub fn observe(&mut self, label: GestureLabel) -> Option<GestureLabel> {
        if label == self.last && label != GestureLabel::None {
            self.count += 1;
        } else {
            self.last = label;
            self.count = 1;
        }

        if self.last != GestureLabel::None && self.count >= self.threshold {
            let confirmed = self.last;
            self.reset();
            return Some(confirmed);
        }
        None
    }

    /// 人物が検出されなかったフレームで呼ぶ
    pub fn reset(&mut self) {
        self.last = GestureLabel::None;
        self.count = 0;
    }
}

/// 自動発火のクールダウンタイマー
#[derive(Debug)]
pub struct Cooldown {
    period: Duration,
    last_fire: Option<Instant>,
}

impl Cooldown {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_fire: None,
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        match self.last_fire {
            Some(last) => now.duration_since(last) >= self.period,
            None => true,
        }
    }

    pub fn refresh(&mut self, now: Instant) {
        self.last_fire = Some(now);
    }
}

/// 1カメラ分の処理ワーカー
///
/// キャプチャ → ROIクロップ → 霞除去 → 人物検出 → ジェスチャー分類 →
/// 確定ヒステリシス → クールダウン付き発火、を1スレッドで回す。
/// ストリーム断では無期限に再接続を試み、プロセスを落とさない。
pub struct CameraWorker {
    config: CameraConfig,
    window: WorkingWindow,
    mode: SharedMode,
    actions: Arc<HashMap<String, String>>,
    trigger: Arc<dyn Trigger>,
    perception: Box<dyn Perception>,
    source: Box<dyn VideoSource>,
    stop: Arc<AtomicBool>,
    timings: WorkerTimings,
    state: WorkerState,
    hysteresis: GestureHysteresis,
    cooldown: Cooldown,
    snapshot: Arc<Mutex<Option<Mat>>>,
}

/// 起動済みワーカーへのハンドル
///
/// スナップショットの読み出しと停止後のjoinに使う。
pub struct WorkerHandle {
    pub camera_id: u32,
    snapshot: Arc<Mutex<Option<Mat>>>,
    handle: thread::JoinHandle<()>,
}

impl WorkerHandle {
    /// 最新フレームの防御的コピーを返す。初回フレーム前はNone。
    pub fn latest_frame(&self) -> Option<Mat> {
        let guard = self.snapshot.lock().unwrap();
        guard.as_ref().map(|m| m.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

impl CameraWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CameraConfig,
        window: WorkingWindow,
        mode: SharedMode,
        actions: Arc<HashMap<String, String>>,
        trigger: Arc<dyn Trigger>,
        perception: Box<dyn Perception>,
        source: Box<dyn VideoSource>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let timings = WorkerTimings::default();
        let cooldown = Cooldown::new(timings.cooldown);
        Self {
            config,
            window,
            mode,
            actions,
            trigger,
            perception,
            source,
            stop,
            timings,
            state: WorkerState::Connecting,
            hysteresis: GestureHysteresis::new(CONFIRMATION_THRESHOLD),
            cooldown,
            snapshot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_timings(mut self, timings: WorkerTimings) -> Self {
        self.cooldown = Cooldown::new(timings.cooldown);
        self.timings = timings;
        self
    }

    /// ワーカースレッドを起動してハンドルを返す
    pub fn spawn(self) -> WorkerHandle {
        let camera_id = self.config.id;
        let snapshot = Arc::clone(&self.snapshot);
        let handle = thread::spawn(move || self.run());
        WorkerHandle {
            camera_id,
            snapshot,
            handle,
        }
    }

    /// メインループ。停止フラグが立つまで戻らない。
    pub fn run(mut self) {
        info!("Starting worker for camera ID: {}", self.config.id);
        self.state = WorkerState::Connecting;

        while !self.stop.load(Ordering::Relaxed) {
            match self.state {
                WorkerState::Connecting | WorkerState::Reconnecting => match self.source.open() {
                    Ok(()) => {
                        info!(
                            "Camera ID {} | opened source {:?}",
                            self.config.id, self.config.video_url
                        );
                        self.state = WorkerState::Streaming;
                    }
                    Err(e) => {
                        error!("Camera ID {} | failed to open source: {e:#}", self.config.id);
                        self.state = WorkerState::Reconnecting;
                        if self.sleep_checking_stop(self.timings.reconnect_backoff) {
                            break;
                        }
                    }
                },
                WorkerState::Streaming => {
                    // 稼働時間外は処理を止めて長めに眠る
                    if !self.window.is_open_now() {
                        self.hysteresis.reset();
                        if self.sleep_checking_stop(self.timings.off_hours_pause) {
                            break;
                        }
                        continue;
                    }

                    match self.source.read_frame() {
                        Ok(frame) => {
                            if let Err(e) = self.store_snapshot(&frame) {
                                warn!("Camera ID {} | snapshot update failed: {e:#}", self.config.id);
                            }
                            if let Err(e) = self.process_frame(&frame) {
                                error!(
                                    "Camera ID {} | frame processing failed: {e:#}",
                                    self.config.id
                                );
                            }
                            thread::sleep(self.timings.frame_pause);
                        }
                        Err(e) => {
                            error!("Camera ID {} connection lost: {e:#}", self.config.id);
                            self.state = WorkerState::Reconnecting;
                            if self.sleep_checking_stop(self.timings.reconnect_backoff) {
                                break;
                            }
                        }
                    }
                }
                WorkerState::Stopped => break,
            }
        }

        // どの経路でもソースは必ず一度だけ解放する
        self.source.release();
        self.state = WorkerState::Stopped;
        info!("Stopping worker for camera ID: {}", self.config.id);
    }

    /// 1フレーム分の検出・分類・発火判定
    fn process_frame(&mut self, frame: &Mat) -> Result<()> {
        let [x, y, w, h] = self.config.roi;
        let roi_rect = clamp_rect(Rect::new(x, y, w, h), frame.cols(), frame.rows());
        if roi_rect.width < MIN_BOX_SIDE || roi_rect.height < MIN_BOX_SIDE {
            anyhow::bail!("ROI lies outside the frame");
        }

        let roi_frame = Mat::roi(frame, roi_rect)?.try_clone()?;
        let enhanced = enhance(&roi_frame)?;

        let detections = self.perception.detect_persons(&enhanced)?;
        if detections.is_empty() {
            // 人物なし: ヒステリシスは即リセット
            self.hysteresis.reset();
            return Ok(());
        }

        let mut confirmed = false;
        for rect in &detections {
            let clamped = clamp_rect(*rect, enhanced.cols(), enhanced.rows());
            if clamped.width < MIN_BOX_SIDE || clamped.height < MIN_BOX_SIDE {
                continue;
            }

            let person_crop = Mat::roi(&enhanced, clamped)?.try_clone()?;
            let label = match self.perception.classify_gesture(&person_crop) {
                Ok(label) => label,
                Err(e) => {
                    error!(
                        "Camera ID {} | gesture recognition failed: {e:#}",
                        self.config.id
                    );
                    GestureLabel::None
                }
            };

            if let Some(gesture) = self.hysteresis.observe(label) {
                self.handle_confirmed(gesture);
                confirmed = true;
                break;
            }
        }

        // 在室フォールバック: ジェスチャー未確定・AUTO・クールダウン経過時のみ
        if !confirmed && self.mode.get() == SystemMode::Auto {
            let now = Instant::now();
            if self.cooldown.ready(now) {
                info!("Camera ID {} | Human detected", self.config.id);
                self.trigger.fire(&self.config.api_url);
                self.cooldown.refresh(now);
            }
        }

        Ok(())
    }

    /// 確定ジェスチャーをアクションに写像して発火する
    fn handle_confirmed(&mut self, gesture: GestureLabel) {
        info!(
            "Camera ID {} | Detected gesture {}",
            self.config.id,
            gesture.as_str()
        );

        let action_key = match gesture {
            GestureLabel::ArmsCrossed => {
                self.mode.set(SystemMode::Manual);
                "system_off"
            }
            GestureLabel::OneArmUp => {
                self.mode.set(SystemMode::Auto);
                "system_on"
            }
            GestureLabel::Peace => "peace",
            GestureLabel::ThumbsUp => "thumbs_up",
            GestureLabel::ThumbsDown => "thumbs_down",
            GestureLabel::None => return,
        };

        match self.actions.get(action_key) {
            Some(url) => {
                info!("Sending gesture action request to {url}");
                self.trigger.fire(url);
                self.cooldown.refresh(Instant::now());
            }
            None => {
                warn!(
                    "Camera ID {} | no action URL configured for {action_key}",
                    self.config.id
                );
            }
        }
    }

    /// 設定に応じて補正後または生フレームを保存する
    fn store_snapshot(&self, frame: &Mat) -> Result<()> {
        let shot = if self.config.snapshot_enhanced {
            enhance(frame)?
        } else {
            frame.clone()
        };
        *self.snapshot.lock().unwrap() = Some(shot);
        Ok(())
    }

    /// 停止フラグを細かく見ながら眠る。停止が観測されたらtrue。
    fn sleep_checking_stop(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if self.stop.load(Ordering::Relaxed) {
                return true;
            }
            thread::sleep(self.timings.stop_poll.min(total));
        }
        self.stop.load(Ordering::Relaxed)
    }
}
