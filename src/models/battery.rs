//! バッテリーシミュレータ
//!
//! 各ドローンが持つ内部充電量のバックグラウンド減衰モデルです。
//! 充電量は容量(mAh)×27.7 の内部時間単位で初期化され、アーム中は
//! 毎秒1.0、待機中は毎秒0.5ずつ減少します。停止は番兵値 -1.0 を
//! 書き込むことで通知します。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::models::drone::DroneModel;

/// 容量1mAhあたりの内部時間単位
pub const CHARGE_UNITS_PER_MAH: f64 = 27.7;

/// 停止を表す番兵値
const STOP_SENTINEL: f64 = -1.0;

/// ドローン1機分のバッテリー状態
#[derive(Debug)]
pub struct BatteryModel {
    charge: Mutex<f64>,
    max_charge: f64,
    rated_voltage: f64,
}

impl BatteryModel {
    pub fn new(capacity_mah: f64, rated_voltage: f64) -> Self {
        let max_charge = capacity_mah * CHARGE_UNITS_PER_MAH;
        Self {
            charge: Mutex::new(max_charge),
            max_charge,
            rated_voltage,
        }
    }

    /// 現在の充電量（内部時間単位）
    pub fn charge(&self) -> f64 {
        *self.charge.lock().unwrap()
    }

    /// 1秒分の減衰を適用（アーム中1.0、待機中0.5）
    ///
    /// 充電量は単調非増加で、ゼロ以下になったら減衰は停止します。
    pub fn drain_one_second(&self, armed: bool) {
        let mut charge = self.charge.lock().unwrap();
        if *charge > 0.0 {
            *charge -= if armed { 1.0 } else { 0.5 };
        }
    }

    /// 報告電圧 = 充電量 / 最大充電量 × 定格電圧（小数1桁に丸め）
    pub fn voltage(&self) -> f64 {
        let charge = *self.charge.lock().unwrap();
        (charge / self.max_charge * self.rated_voltage * 10.0).round() / 10.0
    }

    /// 減衰ループへ停止を通知
    pub fn stop(&self) {
        *self.charge.lock().unwrap() = STOP_SENTINEL;
    }

    /// 充電量が尽きたか（停止番兵も含む）
    pub fn is_exhausted(&self) -> bool {
        *self.charge.lock().unwrap() <= 0.0
    }
}

/// バッテリー減衰ループ
///
/// 充電量が尽きるか停止番兵を観測するまで毎秒減衰を適用します。
/// エンドポイント停止時は `BatteryModel::stop` が次の周回で観測されます。
pub async fn run_decay(model: Arc<DroneModel>) {
    while model.battery.charge() > 0.0 {
        model.battery.drain_one_second(model.is_armed());
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    debug!(
        object_id = model.object_id(),
        "バッテリー減衰ループ終了 (電圧: {:.1}V)",
        model.battery.voltage()
    );
}
