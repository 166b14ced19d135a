use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use reqwest::blocking::{multipart, Client};

/// リモート到達不能時に返すデフォルト応答
pub const DEFAULT_RECOGNIZE_RESPONSE: &str = r#"{"gesture":"NONE"}"#;

/// HTTPリクエストのタイムアウト
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// 照明アクチュエータへの発火インタフェース
///
/// ワーカーはこのトレイト越しに発火する（テストでは記録用実装に差し替え）。
pub trait Trigger: Send + Sync {
    /// fire-and-forget のGETリクエスト。結果は呼び出し元に返らない。
    fn fire(&self, url: &str);
}

/// HTTPアクチュエーションゲートウェイ
///
/// 発火は別スレッドに切り離し、キャプチャループを決してブロックしない。
/// 画像分類アップロードのみ同期。
pub struct ActuationGateway {
    client: Client,
    recognize_url: String,
}

impl ActuationGateway {
    pub fn new(recognize_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            recognize_url: recognize_url.to_string(),
        })
    }

    /// JPEGクロップを認識エンドポイントへ同期アップロードする
    ///
    /// 応答ボディをそのまま返す。転送失敗時はデフォルトのNONE応答。
    pub fn classify_image(&self, jpeg: Vec<u8>) -> String {
        match self.post_image(jpeg) {
            Ok(body) => body,
            Err(e) => {
                warn!("Gesture recognition request failed: {e:#}");
                DEFAULT_RECOGNIZE_RESPONSE.to_string()
            }
        }
    }

    fn post_image(&self, jpeg: Vec<u8>) -> Result<String> {
        let part = multipart::Part::bytes(jpeg)
            .file_name("crop.jpg")
            .mime_str("image/jpeg")?;
        let form = multipart::Form::new().part("image", part);

        let response = self
            .client
            .post(&self.recognize_url)
            .multipart(form)
            .send()
            .with_context(|| format!("POST {} failed", self.recognize_url))?;

        Ok(response.text()?)
    }
}

impl Trigger for ActuationGateway {
    fn fire(&self, url: &str) {
        info!("Sending request to {url}");

        let client = self.client.clone();
        let url = url.to_string();
        thread::spawn(move || match client.get(&url).send() {
            Ok(response) if response.status().is_success() => {
                info!("Success request to: {url}");
            }
            Ok(response) => {
                error!("Failed request to: {url} | Code: {}", response.status());
            }
            Err(e) => {
                error!("Failed request to: {url} | {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_image_unreachable_returns_default() {
        // 存在しないエンドポイントでもデフォルト応答で返る
        let gateway = ActuationGateway::new("http://127.0.0.1:1/recognize").unwrap();
        let body = gateway.classify_image(vec![0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(body, DEFAULT_RECOGNIZE_RESPONSE);
    }

    #[test]
    fn test_fire_does_not_block() {
        let gateway = ActuationGateway::new("http://127.0.0.1:1/recognize").unwrap();
        let start = std::time::Instant::now();
        gateway.fire("http://127.0.0.1:1/lamp");
        // 発火は即座に戻る（タイムアウト5秒を待たない）
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
