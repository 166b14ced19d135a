use std::sync::Arc;

use anyhow::Result;
use opencv::core::Mat;

use super::{encode_jpeg, parse_remote_label, GestureClassifier, GestureLabel};
use crate::actuate::ActuationGateway;

/// クロップ全体をリモート認識サービスに委譲するストラテジ
///
/// 歴代実装のインタプリタ組み込み版の置き換え。プロセス境界の
/// HTTP呼び出しのみで、応答は固定語彙に写像する（未知はNONE）。
pub struct RemoteClassifier {
    gateway: Arc<ActuationGateway>,
}

impl RemoteClassifier {
    pub fn new(gateway: Arc<ActuationGateway>) -> Self {
        Self { gateway }
    }
}

impl GestureClassifier for RemoteClassifier {
    fn recognize(&mut self, crop: &Mat) -> Result<GestureLabel> {
        let jpeg = encode_jpeg(crop)?;
        let body = self.gateway.classify_image(jpeg);
        Ok(parse_remote_label(&body))
    }
}
