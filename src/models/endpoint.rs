//! ドローンのプロトコルエンドポイント
//!
//! 1機につき1つのUDPエンドポイントを開き、受信コマンドを現在状態に
//! 照らして検証し、物理モデルを駆動し、テレメトリと応答を送出します。
//!
//! ## 機体あたりの実行ライン
//!
//! - 受信ループ: 100msの有限待ちポーリング。動作・バッテリー処理で
//!   ブロックしない
//! - テレメトリループ: heartbeat_rate/3 刻みで位置・センサー・死活を巡回送信
//! - バッテリー減衰ループ（設定で無効化可能）
//! - 受理された移動・離陸・着陸ごとの短命動作タスク
//!
//! 受信経路のトランスポート/コーデック失敗はその場で捕捉し、機体を
//! オフラインにしてエンドポイントを閉じます。再接続はしません。
//! 停止はオンラインフラグを折るだけで、各ループは次の周回境界で終了します。

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::models::battery::{self, BatteryModel};
use crate::models::common::{math_utils, ColorRgb, Pose, Position3D};
use crate::models::drone::DroneModel;
use crate::models::traits::{
    DroneFields, ModelError, ModelEvent, ModelHandler, ObjectFields, ObjectInstance, ObjectKind,
    VisualizationSink, WorldContext,
};
use crate::protocol::{
    self, AckResult, CommandKind, GroundMessage, VehicleCommand, VehicleMessage,
    COMMAND_ECHO_COMPONENT, RC_NEUTRAL, VEHICLE_COMPONENT,
};
use crate::scenario::DroneSettings;

/// 受信ポーリングの上限待ち時間
const RECV_POLL: Duration = Duration::from_millis(100);

/// ドローン1機のネットワークエンドポイント
///
/// 生成時は設定のみを保持し、`start` でモデル生成・ソケット開設・
/// 各ループの起動を行います。
pub struct DroneEndpoint {
    object_id: u32,
    config: Mutex<DroneFields>,
    settings: DroneSettings,
    online: AtomicBool,
    model: Mutex<Option<Arc<DroneModel>>>,
    bound: Mutex<Option<SocketAddr>>,
}

impl DroneEndpoint {
    pub fn new(object_id: u32, fields: DroneFields, settings: DroneSettings) -> Self {
        Self {
            object_id,
            config: Mutex::new(fields),
            settings,
            online: AtomicBool::new(false),
            model: Mutex::new(None),
            bound: Mutex::new(None),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// バインド済みのローカルアドレス（開設後に利用可能）
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap()
    }

    pub fn model(&self) -> Option<Arc<DroneModel>> {
        self.model.lock().unwrap().clone()
    }

    pub fn config(&self) -> DroneFields {
        self.config.lock().unwrap().clone()
    }

    /// 設定の更新。接続情報と初期位置はオフライン時のみ反映されます。
    pub fn update_config(&self, fields: &DroneFields) {
        let mut config = self.config.lock().unwrap();
        if !self.is_online() {
            config.hostname = fields.hostname.clone();
            config.port = fields.port;
            config.start_position = fields.start_position;
        }
        config.trajectory_color = fields.trajectory_color;
    }

    /// エンドポイントの停止。各ループは次の周回境界で終了します。
    pub fn close(&self) {
        self.online.store(false, Ordering::SeqCst);
        if let Some(model) = self.model() {
            model.stop();
        }
    }

    /// ステータスマップ（未起動時は非アーム・0V）
    pub fn status(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        match self.model() {
            Some(model) => {
                map.insert("arm".to_string(), model.is_armed().to_string());
                map.insert(
                    "power".to_string(),
                    format!("{:.1} V.", model.battery.voltage()),
                );
            }
            None => {
                map.insert("arm".to_string(), "false".to_string());
                map.insert("power".to_string(), "0 V.".to_string());
            }
        }
        map
    }

    /// モデルを生成してオンラインにし、エンドポイント駆動タスクを起動
    pub fn start(self: &Arc<Self>, events: mpsc::UnboundedSender<ModelEvent>) {
        let config = self.config();
        let model = Arc::new(DroneModel::new(
            self.object_id,
            config.start_position.into(),
            self.settings.speed,
            BatteryModel::new(self.settings.battery_capacity, self.settings.battery_max),
            events,
        ));
        *self.model.lock().unwrap() = Some(Arc::clone(&model));
        self.online.store(true, Ordering::SeqCst);
        model.emit_initial_state();

        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            endpoint.run(model).await;
        });
    }

    async fn run(self: Arc<Self>, model: Arc<DroneModel>) {
        let (hostname, port) = {
            let config = self.config.lock().unwrap();
            (config.hostname.clone(), config.port)
        };
        let addr = format!("{}:{}", hostname, port);

        let socket = match UdpSocket::bind(&addr).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                error!("エンドポイント {} の開設失敗: {}", addr, e);
                self.online.store(false, Ordering::SeqCst);
                model.stop();
                return;
            }
        };
        *self.bound.lock().unwrap() = socket.local_addr().ok();
        info!("ドローンエンドポイント {} を開設", addr);

        // 最後に受信したピアへテレメトリを返す（udpin方式）
        let peer: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

        let telemetry = tokio::spawn(Arc::clone(&self).telemetry_loop(
            Arc::clone(&model),
            Arc::clone(&socket),
            Arc::clone(&peer),
        ));
        if self.settings.battery_need {
            tokio::spawn(battery::run_decay(Arc::clone(&model)));
        }

        self.receive_loop(&model, &socket, &peer).await;

        self.online.store(false, Ordering::SeqCst);
        model.preempt_motion().await;
        model.stop();
        let _ = telemetry.await;
        info!("{} オフライン", addr);
    }

    /// コマンド受信ループ
    async fn receive_loop(
        &self,
        model: &Arc<DroneModel>,
        socket: &Arc<UdpSocket>,
        peer: &Arc<Mutex<Option<SocketAddr>>>,
    ) {
        let mut buf = [0u8; 512];
        while self.is_online() {
            // 電圧が遮断値を下回ったら強制着陸してエンドポイントを畳む
            if model.battery.voltage() <= self.settings.battery_off {
                warn!(
                    object_id = self.object_id,
                    "バッテリー電圧低下 ({:.1}V)、強制着陸します",
                    model.battery.voltage()
                );
                model
                    .spawn_motion(|m, cancel| async move {
                        m.forced_landing_sequence(&cancel).await;
                    })
                    .await;
                model.wait_motion().await;
                break;
            }

            let received = match timeout(RECV_POLL, socket.recv_from(&mut buf)).await {
                Err(_) => continue, // ポーリング満了
                Ok(Err(e)) => {
                    error!(object_id = self.object_id, "受信エラー: {}", e);
                    break;
                }
                Ok(Ok((len, from))) => {
                    *peer.lock().unwrap() = Some(from);
                    (len, from)
                }
            };

            let (len, from) = received;
            match protocol::decode_ground(&buf[..len]) {
                Ok(message) => self.handle_message(model, socket, from, message).await,
                Err(e) => {
                    error!(object_id = self.object_id, "コーデックエラー: {}", e);
                    break;
                }
            }
        }
    }

    /// 受信メッセージの処理
    async fn handle_message(
        &self,
        model: &Arc<DroneModel>,
        socket: &Arc<UdpSocket>,
        from: SocketAddr,
        message: GroundMessage,
    ) {
        match message {
            GroundMessage::Command(command) => {
                let result = self.apply_command(model, command).await;
                debug!(
                    object_id = self.object_id,
                    "コマンド {:?} -> {:?}", command, result
                );
                self.send_frame(
                    socket,
                    from,
                    VEHICLE_COMPONENT,
                    VehicleMessage::CommandAck {
                        command: command.kind(),
                        result,
                    },
                )
                .await;
            }
            GroundMessage::GoToLocalPoint { x, y, z, yaw } => {
                let pose = Pose::new(x, y, z, yaw);
                // 直前と同一の指令ポーズは抑制する
                if model.pose_differs(pose) {
                    self.send_frame(
                        socket,
                        from,
                        COMMAND_ECHO_COMPONENT,
                        VehicleMessage::PositionTargetEcho { x, y, z, yaw },
                    )
                    .await;
                    model
                        .spawn_motion(move |m, cancel| async move {
                            m.go_to_sequence(pose, cancel).await
                        })
                        .await;
                }
            }
            GroundMessage::RcOverride { ch1, ch2, ch3, ch4 } => {
                let pose = Self::rc_target(model.position(), model.yaw(), ch1, ch2, ch3, ch4);
                model
                    .spawn_motion(move |m, cancel| async move {
                        m.go_to_sequence(pose, cancel).await
                    })
                    .await;
            }
        }
    }

    /// 状態遷移表に基づく個別コマンドの適用
    ///
    /// 未定義の遷移は常にDeniedで応答し、エラーにはしません。
    async fn apply_command(&self, model: &Arc<DroneModel>, command: VehicleCommand) -> AckResult {
        match command {
            VehicleCommand::ArmDisarmToggle => {
                if !model.is_preflight() {
                    model.set_preflight(true);
                    AckResult::Accepted
                } else if model.is_airborne() {
                    // 飛行中のトグルは未定義遷移
                    AckResult::Denied
                } else {
                    model.disarm();
                    AckResult::Accepted
                }
            }
            VehicleCommand::Takeoff => {
                if model.is_airborne() || !model.is_preflight() {
                    AckResult::Denied
                } else if model.motion_in_progress().await {
                    AckResult::InProgress
                } else {
                    model
                        .spawn_motion(|m, cancel| async move {
                            m.takeoff_sequence(&cancel).await;
                        })
                        .await;
                    AckResult::Accepted
                }
            }
            VehicleCommand::Land => {
                if !model.is_airborne() {
                    AckResult::Denied
                } else if model.motion_in_progress().await {
                    AckResult::InProgress
                } else {
                    model
                        .spawn_motion(|m, cancel| async move {
                            m.landing_sequence(&cancel).await;
                        })
                        .await;
                    AckResult::Accepted
                }
            }
            VehicleCommand::SetIndicatorColor { r, g, b } => {
                model.set_color(ColorRgb::new(r, g, b));
                AckResult::Accepted
            }
        }
    }

    /// RCチャンネル入力を機体座標系の増分目標ポーズへ変換
    ///
    /// 各チャンネルは1500中立からの偏差で±の増分にマップされます。
    /// 方位の引数は絶対方位ではなく増分として扱われます。
    fn rc_target(position: Position3D, yaw: f64, ch1: u16, ch2: u16, ch3: u16, ch4: u16) -> Pose {
        let delta_yaw = if ch2 < RC_NEUTRAL {
            5.0
        } else if ch2 > RC_NEUTRAL {
            -5.0
        } else {
            0.0
        };
        let forward = if ch4 < RC_NEUTRAL {
            -0.05
        } else if ch4 > RC_NEUTRAL {
            0.05
        } else {
            0.0
        };
        let side = if ch3 < RC_NEUTRAL {
            -0.05
        } else if ch3 > RC_NEUTRAL {
            0.05
        } else {
            0.0
        };
        let delta_z = if ch1 < RC_NEUTRAL {
            -0.05
        } else if ch1 > RC_NEUTRAL {
            0.05
        } else {
            0.0
        };

        let (dx, dy) = math_utils::rc_body_delta(forward, side, yaw, delta_yaw);
        Pose::new(
            position.x + dx,
            position.y + dy,
            position.z + delta_z,
            delta_yaw,
        )
    }

    /// テレメトリ巡回ループ（位置/到達数 → センサー → 死活の順）
    async fn telemetry_loop(
        self: Arc<Self>,
        model: Arc<DroneModel>,
        socket: Arc<UdpSocket>,
        peer: Arc<Mutex<Option<SocketAddr>>>,
    ) {
        let third = Duration::from_secs_f64(self.settings.heartbeat_rate / 3.0);
        while self.is_online() {
            let target = *peer.lock().unwrap();
            if let Some(addr) = target {
                let p = model.position();
                self.send_frame(
                    &socket,
                    addr,
                    VEHICLE_COMPONENT,
                    VehicleMessage::LocalPosition {
                        time_s: unix_seconds(),
                        x: p.x,
                        y: p.y,
                        z: p.z,
                    },
                )
                .await;
                self.send_frame(
                    &socket,
                    addr,
                    VEHICLE_COMPONENT,
                    VehicleMessage::WaypointReached {
                        seq: model.waypoints_reached(),
                    },
                )
                .await;
            }
            tokio::time::sleep(third).await;

            let target = *peer.lock().unwrap();
            if let Some(addr) = target {
                self.send_frame(
                    &socket,
                    addr,
                    VEHICLE_COMPONENT,
                    VehicleMessage::DistanceSensor {
                        channel: protocol::SensorChannel::Temperature,
                        value: model.temperature(),
                    },
                )
                .await;
                self.send_frame(
                    &socket,
                    addr,
                    VEHICLE_COMPONENT,
                    VehicleMessage::DistanceSensor {
                        channel: protocol::SensorChannel::LaserHeight,
                        value: model.position().z,
                    },
                )
                .await;
            }
            tokio::time::sleep(third).await;

            let target = *peer.lock().unwrap();
            if let Some(addr) = target {
                self.send_frame(&socket, addr, VEHICLE_COMPONENT, VehicleMessage::Heartbeat)
                    .await;
            }
            tokio::time::sleep(third).await;
        }
    }

    async fn send_frame(
        &self,
        socket: &UdpSocket,
        to: SocketAddr,
        component: u8,
        message: VehicleMessage,
    ) {
        match protocol::encode_vehicle(component, &message) {
            Ok(buf) => {
                if let Err(e) = socket.send_to(&buf, to).await {
                    warn!(object_id = self.object_id, "送信失敗: {}", e);
                }
            }
            Err(e) => warn!(object_id = self.object_id, "エンコード失敗: {}", e),
        }
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// ドローンのライフサイクルハンドラ
pub struct DroneHandler;

impl ModelHandler for DroneHandler {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Drone
    }

    fn default_fields(&self) -> ObjectFields {
        ObjectFields::Drone(DroneFields::default())
    }

    fn check_fields(&self, fields: &ObjectFields) -> bool {
        fields.as_drone().is_ok_and(|f| !f.hostname.is_empty())
    }

    fn describe(&self, fields: &ObjectFields) -> String {
        match fields.as_drone() {
            Ok(f) => format!(
                "ホスト: {}, ポート: {}, 初期位置: ({:.1}, {:.1}, {:.1}), 軌跡色: ({}, {}, {})",
                f.hostname,
                f.port,
                f.start_position.x,
                f.start_position.y,
                f.start_position.z,
                f.trajectory_color.r,
                f.trajectory_color.g,
                f.trajectory_color.b,
            ),
            Err(_) => String::new(),
        }
    }

    fn reports_status(&self) -> bool {
        true
    }

    fn pack(&self, fields: &ObjectFields) -> Result<serde_yaml::Value, ModelError> {
        serde_yaml::to_value(fields.as_drone()?).map_err(ModelError::InvalidRecord)
    }

    fn unpack(&self, record: &serde_yaml::Value) -> Result<ObjectFields, ModelError> {
        let fields: DroneFields =
            serde_yaml::from_value(record.clone()).map_err(ModelError::InvalidRecord)?;
        Ok(ObjectFields::Drone(fields))
    }

    fn create(
        &self,
        fields: &ObjectFields,
        ctx: &WorldContext<'_>,
    ) -> Result<ObjectInstance, ModelError> {
        let f = fields.as_drone()?;
        ctx.viz.add_model(
            ObjectKind::Drone,
            f.start_position.into(),
            0.0,
            true,
            f.trajectory_color.into(),
        );
        let endpoint = DroneEndpoint::new(ctx.object_id, f.clone(), ctx.settings.drone.clone());
        Ok(ObjectInstance::Drone(Arc::new(endpoint)))
    }

    fn update(
        &self,
        instance: &mut ObjectInstance,
        _index: usize,
        fields: &ObjectFields,
        _viz: &dyn VisualizationSink,
    ) -> Result<(), ModelError> {
        let f = fields.as_drone()?;
        let ObjectInstance::Drone(endpoint) = instance else {
            return Err(ModelError::kind_mismatch(ObjectKind::Drone, instance.kind()));
        };
        endpoint.update_config(f);
        Ok(())
    }

    fn start(&self, instance: &ObjectInstance, ctx: &WorldContext<'_>) -> Result<(), ModelError> {
        let ObjectInstance::Drone(endpoint) = instance else {
            return Err(ModelError::kind_mismatch(ObjectKind::Drone, instance.kind()));
        };
        endpoint.start(ctx.events.clone());
        Ok(())
    }

    fn close(&self, instance: &ObjectInstance) {
        if let ObjectInstance::Drone(endpoint) = instance {
            endpoint.close();
        }
    }

    fn status(&self, instance: &ObjectInstance) -> BTreeMap<String, String> {
        match instance {
            ObjectInstance::Drone(endpoint) => endpoint.status(),
            _ => BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::traits::Vec3Record;
    use crate::protocol::{decode_vehicle, encode_ground};

    fn test_settings(speed: f64) -> DroneSettings {
        DroneSettings {
            speed,
            heartbeat_rate: 0.03,
            battery_need: false,
            battery_capacity: 1300.0,
            battery_max: 7.2,
            battery_off: 6.6,
        }
    }

    fn test_fields(port: u16) -> DroneFields {
        DroneFields {
            hostname: "127.0.0.1".to_string(),
            port,
            start_position: Vec3Record::default(),
            trajectory_color: Default::default(),
        }
    }

    fn test_pair(speed: f64) -> (Arc<DroneEndpoint>, Arc<DroneModel>) {
        let endpoint = Arc::new(DroneEndpoint::new(0, test_fields(0), test_settings(speed)));
        let (events, _rx) = mpsc::unbounded_channel();
        let model = Arc::new(DroneModel::new(
            0,
            Position3D::default(),
            speed,
            BatteryModel::new(1300.0, 7.2),
            events,
        ));
        (endpoint, model)
    }

    #[tokio::test]
    async fn test_command_state_machine_cycle() {
        let (endpoint, model) = test_pair(100_000.0);

        // 待機状態からの離陸・着陸は拒否
        assert_eq!(
            endpoint.apply_command(&model, VehicleCommand::Takeoff).await,
            AckResult::Denied
        );
        assert_eq!(
            endpoint.apply_command(&model, VehicleCommand::Land).await,
            AckResult::Denied
        );

        // アーム → 離陸 → 着陸 → トグル
        assert_eq!(
            endpoint
                .apply_command(&model, VehicleCommand::ArmDisarmToggle)
                .await,
            AckResult::Accepted
        );
        assert!(model.is_preflight());

        assert_eq!(
            endpoint.apply_command(&model, VehicleCommand::Takeoff).await,
            AckResult::Accepted
        );
        model.wait_motion().await;
        assert!(model.is_airborne());

        // 既に飛行中の離陸は拒否
        assert_eq!(
            endpoint.apply_command(&model, VehicleCommand::Takeoff).await,
            AckResult::Denied
        );
        // 飛行中のトグルは未定義遷移
        assert_eq!(
            endpoint
                .apply_command(&model, VehicleCommand::ArmDisarmToggle)
                .await,
            AckResult::Denied
        );

        assert_eq!(
            endpoint.apply_command(&model, VehicleCommand::Land).await,
            AckResult::Accepted
        );
        model.wait_motion().await;
        assert!(!model.is_airborne());
        assert!(!model.is_preflight());

        // トグルは到達カウンタに影響しない（離陸+着陸の2のまま）
        assert_eq!(model.waypoints_reached(), 2);
        assert_eq!(
            endpoint
                .apply_command(&model, VehicleCommand::ArmDisarmToggle)
                .await,
            AckResult::Accepted
        );
        assert_eq!(
            endpoint
                .apply_command(&model, VehicleCommand::ArmDisarmToggle)
                .await,
            AckResult::Accepted
        );
        assert!(!model.is_armed());
        assert_eq!(model.waypoints_reached(), 2);
    }

    #[tokio::test]
    async fn test_takeoff_in_progress_ack() {
        let (endpoint, model) = test_pair(100.0);
        endpoint
            .apply_command(&model, VehicleCommand::ArmDisarmToggle)
            .await;
        assert_eq!(
            endpoint.apply_command(&model, VehicleCommand::Takeoff).await,
            AckResult::Accepted
        );
        // 離陸実行中の再指令はInProgress
        assert_eq!(
            endpoint.apply_command(&model, VehicleCommand::Takeoff).await,
            AckResult::InProgress
        );
        model.wait_motion().await;
    }

    #[tokio::test]
    async fn test_set_color_always_accepted() {
        let (endpoint, model) = test_pair(100_000.0);
        let result = endpoint
            .apply_command(&model, VehicleCommand::SetIndicatorColor { r: 10, g: 20, b: 30 })
            .await;
        assert_eq!(result, AckResult::Accepted);
        assert_eq!(model.color(), ColorRgb::new(10, 20, 30));
    }

    #[test]
    fn test_rc_target_channel_mapping() {
        let position = Position3D::new(1.0, 2.0, 0.5);
        // ch1>1500: 上昇, ch2<1500: 左旋回+5度, 他は中立
        let pose = DroneEndpoint::rc_target(position, 0.0, 1600, 1400, 1500, 1500);
        assert!((pose.z - 0.55).abs() < 1e-9);
        assert!((pose.yaw - 5.0).abs() < 1e-9);
        assert!((pose.x - position.x).abs() < 1e-9);

        // ch4>1500: 前進0.05（方位0度ならx軸方向）
        let pose = DroneEndpoint::rc_target(position, 0.0, 1500, 1500, 1500, 1600);
        assert!((pose.x - 1.05).abs() < 1e-9);
        assert!((pose.yaw).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_udp_command_ack_and_telemetry() {
        let endpoint = Arc::new(DroneEndpoint::new(
            7,
            test_fields(0),
            test_settings(100_000.0),
        ));
        let (events, _rx) = mpsc::unbounded_channel();
        endpoint.start(events);

        // バインド完了を待つ
        let mut addr = None;
        for _ in 0..100 {
            addr = endpoint.local_addr();
            if addr.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let addr = addr.expect("エンドポイントが開設されない");

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let arm = encode_ground(&GroundMessage::Command(VehicleCommand::ArmDisarmToggle)).unwrap();
        client.send_to(&arm, addr).await.unwrap();

        // 応答の到着を待つ（テレメトリと混在するのでAckが出るまで読む）
        let mut buf = [0u8; 512];
        let mut ack = None;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            let Ok(Ok((len, _))) =
                timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await
            else {
                continue;
            };
            if let Ok(frame) = decode_vehicle(&buf[..len]) {
                if let VehicleMessage::CommandAck { command, result } = frame.message {
                    ack = Some((frame.component, command, result));
                    break;
                }
            }
        }
        let (component, command, result) = ack.expect("コマンド応答が届かない");
        assert_eq!(component, VEHICLE_COMPONENT);
        assert_eq!(command, CommandKind::ArmDisarmToggle);
        assert_eq!(result, AckResult::Accepted);
        assert!(endpoint.model().unwrap().is_armed());

        // ピア確立後はテレメトリも流れてくる
        let mut saw_position = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            let Ok(Ok((len, _))) =
                timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await
            else {
                continue;
            };
            if let Ok(frame) = decode_vehicle(&buf[..len]) {
                if matches!(frame.message, VehicleMessage::LocalPosition { .. }) {
                    saw_position = true;
                    break;
                }
            }
        }
        assert!(saw_position);

        endpoint.close();
        assert!(!endpoint.is_online());
    }

    #[tokio::test]
    async fn test_battery_cutoff_forces_landing_and_shutdown() {
        let mut settings = test_settings(100_000.0);
        settings.battery_need = true;
        settings.battery_off = 7.2; // 満充電電圧と同値なので即時に遮断される
        let endpoint = Arc::new(DroneEndpoint::new(8, test_fields(0), settings));
        let (events, _rx) = mpsc::unbounded_channel();
        endpoint.start(events);

        let mut offline = false;
        for _ in 0..200 {
            if endpoint.local_addr().is_some() && !endpoint.is_online() {
                offline = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(offline, "バッテリー遮断でオフラインにならない");

        let model = endpoint.model().unwrap();
        assert!(!model.is_armed());
        assert!(model.position().z.abs() < 1e-9);
        // 強制着陸は到達ウェイポイントとして数えない
        assert_eq!(model.waypoints_reached(), 0);
    }

    #[test]
    fn test_handler_check_fields_requires_hostname() {
        let handler = DroneHandler;
        assert!(!handler.check_fields(&ObjectFields::Drone(DroneFields::default())));
        assert!(handler.check_fields(&ObjectFields::Drone(test_fields(8001))));
    }
}
