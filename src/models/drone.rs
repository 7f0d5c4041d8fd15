//! ドローン物理モデル
//!
//! 1機分の位置・方位・フラグ・LED色・温度読みを保持し、ステップ実行の
//! 移動・旋回・離陸・着陸アルゴリズムを提供します。移動は0.01空間
//! ユニット刻み、ステップ間は `1/speed` 秒のスリープです。
//!
//! ## 動作タスクとキャンセル
//!
//! 実行中の動作は機体あたり常に最大1つです。`spawn_motion` は動作スロットの
//! ロックを保持したまま、先行タスクへ watch チャンネルでキャンセルを通知し、
//! その完了を待ってから後続タスクを起動します。共有boolフラグによる
//! 協調キャンセルと違い、新旧タスクが同時に走る瞬間はありません。
//! 全シーケンス（移動・旋回・離陸・着陸）は各ステップ前にキャンセルを
//! 確認するため、引き継ぎの待ち時間は1ステップ間隔で抑えられます。
//!
//! 位置・方位・色の全変更は `ModelEvent` として通知されます。これが
//! 可視化へ動きが伝わる唯一の経路です。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::models::battery::BatteryModel;
use crate::models::common::{ColorRgb, Pose, Position3D};
use crate::models::traits::ModelEvent;

/// 1ステップの移動量（空間ユニット）
const STEP_SIZE: f64 = 0.01;
/// 離陸の固定ステップ数（到達高度 1.0 ユニット）
const TAKEOFF_STEPS: u32 = 100;
/// 温度センサーの環境既定値
const AMBIENT_TEMPERATURE: f64 = 20.0;

/// 可変状態（ロック下でのみ触る）
#[derive(Debug)]
struct DroneState {
    position: Position3D,
    yaw: f64,
    color: ColorRgb,
    /// アーム（プリフライト）状態
    preflight: bool,
    /// 飛行中フラグ（airborne ⇒ preflight）
    airborne: bool,
    /// 重複指令抑制用の最終指令ポーズ
    last_pose: Pose,
    /// 熱源ID順の温度読み
    temp_readings: Vec<f64>,
}

/// 実行中の動作タスク
struct MotionTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// ドローン1機の物理モデル
pub struct DroneModel {
    object_id: u32,
    speed: f64,
    state: Mutex<DroneState>,
    pub battery: BatteryModel,
    reached: AtomicU32,
    events: mpsc::UnboundedSender<ModelEvent>,
    motion: tokio::sync::Mutex<Option<MotionTask>>,
}

impl DroneModel {
    pub fn new(
        object_id: u32,
        start: Position3D,
        speed: f64,
        battery: BatteryModel,
        events: mpsc::UnboundedSender<ModelEvent>,
    ) -> Self {
        Self {
            object_id,
            speed,
            state: Mutex::new(DroneState {
                position: start,
                yaw: 0.0,
                color: ColorRgb::default(),
                preflight: false,
                airborne: false,
                last_pose: Pose::new(start.x, start.y, start.z, 0.0),
                temp_readings: Vec::new(),
            }),
            battery,
            reached: AtomicU32::new(0),
            events,
            motion: tokio::sync::Mutex::new(None),
        }
    }

    pub fn object_id(&self) -> u32 {
        self.object_id
    }

    fn step_delay(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.speed)
    }

    pub fn position(&self) -> Position3D {
        self.state.lock().unwrap().position
    }

    pub fn yaw(&self) -> f64 {
        self.state.lock().unwrap().yaw
    }

    pub fn color(&self) -> ColorRgb {
        self.state.lock().unwrap().color
    }

    pub fn is_preflight(&self) -> bool {
        self.state.lock().unwrap().preflight
    }

    pub fn is_airborne(&self) -> bool {
        self.state.lock().unwrap().airborne
    }

    /// モーター駆動中か（プリフライトまたは飛行中）
    pub fn is_armed(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.preflight || state.airborne
    }

    pub fn set_preflight(&self, value: bool) {
        self.state.lock().unwrap().preflight = value;
    }

    /// 到達ウェイポイント数（単調増加）
    pub fn waypoints_reached(&self) -> u32 {
        self.reached.load(Ordering::SeqCst)
    }

    /// 指令ポーズが最終指令と異なるか（重複抑制）
    pub fn pose_differs(&self, pose: Pose) -> bool {
        self.state.lock().unwrap().last_pose != pose
    }

    fn set_last_pose(&self, pose: Pose) {
        self.state.lock().unwrap().last_pose = pose;
    }

    /// 全熱源の読みの最大値。熱源がなければ環境温度。
    pub fn temperature(&self) -> f64 {
        let state = self.state.lock().unwrap();
        state
            .temp_readings
            .iter()
            .copied()
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.max(v))))
            .unwrap_or(AMBIENT_TEMPERATURE)
    }

    /// 熱源IDごとの温度読みを更新（ライフサイクルマネージャが呼ぶ）
    pub fn set_temperature(&self, source_id: usize, value: f64) {
        let mut state = self.state.lock().unwrap();
        if source_id < state.temp_readings.len() {
            state.temp_readings[source_id] = value;
        } else {
            state.temp_readings.push(value);
        }
    }

    /// バッテリー減衰ループへ停止を通知
    pub fn stop(&self) {
        self.battery.stop();
    }

    fn notify_position(&self) {
        let (position, yaw) = {
            let state = self.state.lock().unwrap();
            (state.position, state.yaw)
        };
        let _ = self.events.send(ModelEvent::PositionChanged {
            object_id: self.object_id,
            position,
            yaw,
        });
    }

    fn notify_color(&self) {
        let color = self.state.lock().unwrap().color;
        let _ = self.events.send(ModelEvent::ColorChanged {
            object_id: self.object_id,
            color,
        });
    }

    /// 起動直後の初期状態を可視化へ流す
    pub fn emit_initial_state(&self) {
        self.notify_position();
        self.notify_color();
    }

    /// LED色を変更して通知
    pub fn set_color(&self, color: ColorRgb) {
        self.state.lock().unwrap().color = color;
        self.notify_color();
    }

    /// 即時ディスアーム: 高度ゼロ・両フラグ解除
    pub fn disarm(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.position.z = 0.0;
            state.preflight = false;
            state.airborne = false;
            state.last_pose =
                Pose::new(state.position.x, state.position.y, 0.0, state.yaw);
        }
        self.notify_position();
    }

    /// 目標点への直線移動
    ///
    /// `floor(距離*100) - 1` ステップ、各ステップ前にキャンセルを確認します。
    /// 完了したらtrue、キャンセルで中断したらfalseを返します。
    async fn go_to_point(&self, target: Position3D, cancel: &watch::Receiver<bool>) -> bool {
        let (delta, distance) = {
            let state = self.state.lock().unwrap();
            (target - state.position, state.position.distance_3d(&target))
        };
        let steps = (distance * 100.0).floor() as i64 - 1;
        if steps <= 0 {
            return true;
        }
        let step = Position3D::new(
            delta.x / distance * STEP_SIZE,
            delta.y / distance * STEP_SIZE,
            delta.z / distance * STEP_SIZE,
        );
        for _ in 0..steps {
            if *cancel.borrow() {
                return false;
            }
            {
                let mut state = self.state.lock().unwrap();
                state.position = state.position + step;
            }
            self.notify_position();
            tokio::time::sleep(self.step_delay()).await;
        }
        true
    }

    /// 1度刻みの旋回。符号は増分の符号に従います。
    async fn rotate_yaw(&self, delta_deg: f64, cancel: &watch::Receiver<bool>) -> bool {
        let steps = delta_deg.abs().floor() as i64;
        let direction = if delta_deg < 0.0 { -1.0 } else { 1.0 };
        for _ in 0..steps {
            if *cancel.borrow() {
                return false;
            }
            {
                let mut state = self.state.lock().unwrap();
                state.yaw += direction;
            }
            self.notify_position();
            tokio::time::sleep(self.step_delay()).await;
        }
        true
    }

    /// 離陸シーケンス（固定100ステップ、完了で飛行状態）
    ///
    /// 各ステップ前にキャンセルを確認します。中断時は飛行フラグも
    /// 到達カウンタも変更しません。
    pub async fn takeoff_sequence(&self, cancel: &watch::Receiver<bool>) -> bool {
        for _ in 0..TAKEOFF_STEPS {
            if *cancel.borrow() {
                return false;
            }
            {
                let mut state = self.state.lock().unwrap();
                state.position.z += STEP_SIZE;
            }
            self.notify_position();
            tokio::time::sleep(self.step_delay()).await;
        }
        self.state.lock().unwrap().airborne = true;
        self.reached.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// 降下と接地処理（着陸系シーケンスの共通部）
    ///
    /// 中断時はフラグを変更せず、現在高度のまま後続の動作へ引き継ぎます。
    async fn descend_and_settle(&self, cancel: &watch::Receiver<bool>) -> bool {
        let steps = (self.position().z * 100.0).floor() as i64;
        for _ in 0..steps {
            if *cancel.borrow() {
                return false;
            }
            {
                let mut state = self.state.lock().unwrap();
                state.position.z -= STEP_SIZE;
            }
            self.notify_position();
            tokio::time::sleep(self.step_delay()).await;
        }
        {
            let mut state = self.state.lock().unwrap();
            state.airborne = false;
            state.preflight = false;
            state.last_pose =
                Pose::new(state.position.x, state.position.y, 0.0, state.yaw);
        }
        self.notify_position();
        true
    }

    /// 着陸シーケンス（現在高度×100ステップで降下、完了でディスアーム）
    ///
    /// 中断されずに完了した場合のみ到達カウンタを進めます。
    pub async fn landing_sequence(&self, cancel: &watch::Receiver<bool>) -> bool {
        if self.descend_and_settle(cancel).await {
            self.reached.fetch_add(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// 強制着陸シーケンス（バッテリー遮断時）
    ///
    /// 指令によらない着陸なので到達カウンタは進めません。
    pub async fn forced_landing_sequence(&self, cancel: &watch::Receiver<bool>) -> bool {
        self.descend_and_settle(cancel).await
    }

    /// 位置指令の実行シーケンス: 旋回してから直線移動
    ///
    /// 中断されずに完了した場合のみ到達カウンタを進めます。完了後は
    /// 最終指令ポーズを番兵値へ戻し、同一地点への再指令を許可します。
    pub async fn go_to_sequence(&self, pose: Pose, cancel: watch::Receiver<bool>) {
        self.set_last_pose(pose);
        let target = Position3D::new(pose.x, pose.y, pose.z);
        if self.rotate_yaw(pose.yaw, &cancel).await && self.go_to_point(target, &cancel).await {
            self.reached.fetch_add(1, Ordering::SeqCst);
        }
        self.set_last_pose(Pose::sentinel());
    }

    /// 動作タスクの起動（先行タスクの置き換え）
    ///
    /// スロットのロックを保持したまま先行タスクへキャンセルを送り、その
    /// 終了を待ってから新タスクを起動します。これにより実行中の動作タスクは
    /// 常に最大1つに保たれます。
    pub async fn spawn_motion<F, Fut>(self: &Arc<Self>, task: F)
    where
        F: FnOnce(Arc<DroneModel>, watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.motion.lock().await;
        if let Some(previous) = slot.take() {
            let _ = previous.cancel.send(true);
            let _ = previous.handle.await;
        }
        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(task(Arc::clone(self), cancel_rx));
        *slot = Some(MotionTask { cancel, handle });
    }

    /// 動作タスクが実行中かどうか
    pub async fn motion_in_progress(&self) -> bool {
        self.motion
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// 実行中の動作タスクの完了を待つ（キャンセルは送らない）
    pub async fn wait_motion(&self) {
        let task = self.motion.lock().await.take();
        if let Some(task) = task {
            let _ = task.handle.await;
        }
    }

    /// 実行中の動作タスクをキャンセルし、終了を待つ
    pub async fn preempt_motion(&self) {
        let task = self.motion.lock().await.take();
        if let Some(task) = task {
            let _ = task.cancel.send(true);
            let _ = task.handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_model(speed: f64) -> Arc<DroneModel> {
        let (events, _rx) = mpsc::unbounded_channel();
        Arc::new(DroneModel::new(
            0,
            Position3D::default(),
            speed,
            BatteryModel::new(1300.0, 7.2),
            events,
        ))
    }

    #[tokio::test]
    async fn test_go_to_point_step_count_and_endpoint() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let model = DroneModel::new(
            0,
            Position3D::default(),
            100_000.0,
            BatteryModel::new(1300.0, 7.2),
            events,
        );
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let completed = model
            .go_to_point(Position3D::new(1.0, 0.0, 0.0), &cancel_rx)
            .await;
        assert!(completed);

        // ステップ数 = floor(距離*100) - 1
        let mut position_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ModelEvent::PositionChanged { .. }) {
                position_events += 1;
            }
        }
        assert_eq!(position_events, 99);

        // 最終位置は1ステップ分の誤差内
        let p = model.position();
        assert!((p.x - 1.0).abs() <= STEP_SIZE + 1e-9);
        assert!(p.y.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_disarm_grounds_from_any_altitude() {
        let model = test_model(100_000.0);
        let (_cancel_tx, cancel) = watch::channel(false);
        model.set_preflight(true);
        model.takeoff_sequence(&cancel).await;
        assert!(model.is_airborne());
        assert!((model.position().z - 1.0).abs() < 1e-9);

        model.disarm();
        assert_eq!(model.position().z, 0.0);
        assert!(!model.is_armed());
        assert!(!model.is_airborne());
    }

    #[tokio::test]
    async fn test_second_target_preempts_first_cleanly() {
        let model = test_model(1_000.0);
        let first = Pose::new(1.0, 0.0, 0.0, 0.0);
        let second = Pose::new(0.5, 0.5, 0.5, 0.0);

        model
            .spawn_motion(move |m, cancel| async move { m.go_to_sequence(first, cancel).await })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        model
            .spawn_motion(move |m, cancel| async move { m.go_to_sequence(second, cancel).await })
            .await;
        model.wait_motion().await;

        // 最終静止位置は2番目の目標のみに一致し、経路の混合は起きない
        let p = model.position();
        let target = Position3D::new(second.x, second.y, second.z);
        assert!(p.distance_3d(&target) <= 2.0 * STEP_SIZE + 1e-9);
        // 1番目の完了は打ち消され、到達カウンタは2番目の分だけ進む
        assert_eq!(model.waypoints_reached(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_pose_suppressed_while_in_flight() {
        let model = test_model(1_000.0);
        let pose = Pose::new(1.0, 0.0, 0.0, 0.0);

        model
            .spawn_motion(move |m, cancel| async move { m.go_to_sequence(pose, cancel).await })
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!model.pose_differs(pose));

        model.wait_motion().await;
        // 完了後は番兵値に戻り、同一地点への再指令が受理される
        assert!(model.pose_differs(pose));
    }

    #[tokio::test]
    async fn test_landing_restores_ground_state() {
        let model = test_model(100_000.0);
        let (_cancel_tx, cancel) = watch::channel(false);
        model.set_preflight(true);
        model.takeoff_sequence(&cancel).await;

        model.landing_sequence(&cancel).await;
        let p = model.position();
        assert!(p.z.abs() <= STEP_SIZE + 1e-9);
        assert!(!model.is_airborne());
        assert!(!model.is_preflight());
        assert_eq!(model.waypoints_reached(), 2);
    }

    #[tokio::test]
    async fn test_preempting_takeoff_returns_within_one_step() {
        // 1ステップ100msの低速設定で離陸中に新目標を割り込ませる
        let model = test_model(10.0);
        model.set_preflight(true);
        model
            .spawn_motion(|m, cancel| async move {
                m.takeoff_sequence(&cancel).await;
            })
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        // 先行タスクの打ち切り待ちは1ステップ間隔程度で収まる
        let target = Pose::new(0.1, 0.0, 0.0, 0.0);
        let started = tokio::time::Instant::now();
        model
            .spawn_motion(move |m, cancel| async move { m.go_to_sequence(target, cancel).await })
            .await;
        assert!(started.elapsed() < Duration::from_secs(2));

        model.wait_motion().await;
        // 中断された離陸は飛行状態にもカウンタにも反映されない
        assert!(!model.is_airborne());
        assert_eq!(model.waypoints_reached(), 1);
    }

    #[tokio::test]
    async fn test_forced_landing_skips_waypoint_counter() {
        let model = test_model(100_000.0);
        let (_cancel_tx, cancel) = watch::channel(false);
        model.set_preflight(true);
        model.takeoff_sequence(&cancel).await;
        assert_eq!(model.waypoints_reached(), 1);

        model.forced_landing_sequence(&cancel).await;
        assert!(!model.is_armed());
        assert!(model.position().z.abs() <= STEP_SIZE + 1e-9);
        // 指令によらない着陸はカウントされない
        assert_eq!(model.waypoints_reached(), 1);
    }

    #[test]
    fn test_temperature_defaults_to_ambient() {
        let (events, _rx) = mpsc::unbounded_channel();
        let model = DroneModel::new(
            0,
            Position3D::default(),
            60.0,
            BatteryModel::new(1300.0, 7.2),
            events,
        );
        assert_eq!(model.temperature(), AMBIENT_TEMPERATURE);

        model.set_temperature(0, 25.0);
        model.set_temperature(1, 55.0);
        model.set_temperature(0, 30.0);
        assert_eq!(model.temperature(), 55.0);
    }
}
