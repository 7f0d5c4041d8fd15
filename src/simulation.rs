//! # Simulation モジュール
//!
//! スワームシミュレーションの中核となるオブジェクトライフサイクル
//! マネージャを提供します。
//!
//! このモジュールは、シナリオに記述された全オブジェクト（ドローン・熱源・
//! 装飾エリア）の生成・更新・削除・起動・停止を管理します。種別ごとの処理は
//! `ObjectKind` をキーに登録された `ModelHandler` へ委譲され、マネージャ自身は
//! 種別を直接判定しません。
//!
//! ## 主要機能
//!
//! - **ハンドラレジストリ**: 種別キーによる静的ディスパッチ
//! - **編集操作**: 停止中のオブジェクト追加・設定更新・削除
//! - **実行制御**: 全オブジェクトの一斉起動と停止
//! - **イベントポンプ**: モデルイベントの可視化反映と温度場サンプリング
//!
//! ## イベントポンプ
//!
//! 稼働中はシミュレーションコア所有のチャンネルでモデルイベントを受信し、
//! 位置変更を可視化へ転送します。同時に、移動したドローンの位置で全熱源を
//! サンプリングし、各機の仮想温度センサーの読みを更新します。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::common::{ColorRgb, Position3D};
use crate::models::drone::DroneModel;
use crate::models::endpoint::DroneEndpoint;
use crate::models::heat_source::HeatSourceModel;
use crate::models::traits::{
    ModelError, ModelEvent, ModelHandler, ObjectFields, ObjectInstance, ObjectKind,
    VisualizationSink, WorldContext,
};
use crate::scenario::{ObjectRecord, SimulationSettings};

/// 登録済みオブジェクト1件
pub struct SimObject {
    /// イベント送信元の識別に使う安定ID（削除後も再利用しない）
    pub id: u32,
    pub kind: ObjectKind,
    pub fields: ObjectFields,
    pub instance: ObjectInstance,
}

/// オブジェクトライフサイクルマネージャ
pub struct SimulationWorld {
    settings: SimulationSettings,
    handlers: HashMap<ObjectKind, Box<dyn ModelHandler>>,
    objects: Vec<SimObject>,
    viz: Arc<dyn VisualizationSink>,
    events_tx: mpsc::UnboundedSender<ModelEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ModelEvent>>,
    shutdown: watch::Sender<bool>,
    pump: Option<JoinHandle<()>>,
    running: bool,
    next_id: u32,
}

impl SimulationWorld {
    pub fn new(settings: SimulationSettings, viz: Arc<dyn VisualizationSink>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            settings,
            handlers: HashMap::new(),
            objects: Vec::new(),
            viz,
            events_tx,
            events_rx: Some(events_rx),
            shutdown,
            pump: None,
            running: false,
            next_id: 0,
        }
    }

    /// 種別ハンドラの登録
    pub fn register(&mut self, handler: Box<dyn ModelHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    fn handler(&self, kind: ObjectKind) -> Result<&dyn ModelHandler, WorldError> {
        self.handlers
            .get(&kind)
            .map(Box::as_ref)
            .ok_or_else(|| WorldError::UnknownKind(kind.to_string()))
    }

    fn kind_count(&self, kind: ObjectKind) -> usize {
        self.objects.iter().filter(|o| o.kind == kind).count()
    }

    /// オブジェクトの追加（停止中のみ）
    pub fn add_object(&mut self, fields: ObjectFields) -> Result<usize, WorldError> {
        if self.running {
            return Err(WorldError::SimulationRunning);
        }
        let kind = fields.kind();
        let handler = self.handler(kind)?;
        if !handler.check_fields(&fields) {
            return Err(WorldError::Model(ModelError::InvalidFields(format!(
                "{} の設定が不正です",
                kind
            ))));
        }

        let ctx = WorldContext {
            object_id: self.next_id,
            index: self.objects.len(),
            kind_count: self.kind_count(kind),
            settings: &self.settings,
            events: self.events_tx.clone(),
            viz: self.viz.as_ref(),
        };
        let instance = handler.create(&fields, &ctx).map_err(WorldError::Model)?;
        info!("オブジェクト追加: {} ({})", kind, handler.describe(&fields));

        let index = self.objects.len();
        self.objects.push(SimObject {
            id: self.next_id,
            kind,
            fields,
            instance,
        });
        self.next_id += 1;
        Ok(index)
    }

    /// 既存オブジェクトの設定更新
    pub fn update_object(&mut self, index: usize, fields: ObjectFields) -> Result<(), WorldError> {
        let object = self
            .objects
            .get_mut(index)
            .ok_or(WorldError::IndexOutOfRange(index))?;
        if object.kind != fields.kind() {
            return Err(WorldError::Model(ModelError::kind_mismatch(
                object.kind,
                fields.kind(),
            )));
        }
        let handler = self
            .handlers
            .get(&object.kind)
            .ok_or_else(|| WorldError::UnknownKind(object.kind.to_string()))?;
        handler
            .update(&mut object.instance, index, &fields, self.viz.as_ref())
            .map_err(WorldError::Model)?;
        object.fields = fields;
        Ok(())
    }

    /// オブジェクトの削除（停止中のみ）
    pub fn remove_object(&mut self, index: usize) -> Result<(), WorldError> {
        if self.running {
            return Err(WorldError::SimulationRunning);
        }
        if index >= self.objects.len() {
            return Err(WorldError::IndexOutOfRange(index));
        }
        let object = self.objects.remove(index);
        if let Ok(handler) = self.handler(object.kind) {
            handler.remove(&object.instance);
        }
        self.viz.remove_model(index);
        info!("オブジェクト削除: {} (index: {})", object.kind, index);
        Ok(())
    }

    /// 永続化レコード列からのオブジェクト復元
    ///
    /// 未知の種別は警告して読み飛ばし、変換に失敗したレコードは既定値で
    /// 補完します。1件の不良がシナリオ全体の読み込みを止めることはありません。
    pub fn load_objects(&mut self, records: &[ObjectRecord]) {
        for record in records {
            let Ok(kind) = record.kind.parse::<ObjectKind>() else {
                warn!("未知のオブジェクト種別を読み飛ばします: {}", record.kind);
                continue;
            };
            let Ok(handler) = self.handler(kind) else {
                warn!("ハンドラ未登録の種別を読み飛ばします: {}", kind);
                continue;
            };
            let fields = match handler.unpack(&record.fields) {
                Ok(fields) => fields,
                Err(e) => {
                    warn!("{} のレコード変換に失敗、既定値を使用します: {}", kind, e);
                    handler.default_fields()
                }
            };
            if let Err(e) = self.add_object(fields) {
                warn!("{} の追加に失敗しました: {}", kind, e);
            }
        }
    }

    /// 現在のオブジェクト列の永続化レコードへの変換
    pub fn export_records(&self) -> Vec<ObjectRecord> {
        let mut records = Vec::with_capacity(self.objects.len());
        for object in &self.objects {
            let Ok(handler) = self.handler(object.kind) else {
                continue;
            };
            match handler.pack(&object.fields) {
                Ok(fields) => records.push(ObjectRecord {
                    kind: object.kind.to_string(),
                    fields,
                }),
                Err(e) => warn!("{} のレコード変換に失敗しました: {}", object.kind, e),
            }
        }
        records
    }

    /// 全オブジェクトの一斉起動
    ///
    /// イベントポンプを起動してから各ハンドラの `start` を呼びます。
    /// 個別の起動失敗はログに残すだけで、他のオブジェクトは止めません。
    pub fn start_all(&mut self) -> Result<(), WorldError> {
        if self.running {
            return Err(WorldError::SimulationRunning);
        }
        let events_rx = self
            .events_rx
            .take()
            .ok_or(WorldError::SimulationRunning)?;

        // ポンプへ渡すスナップショット（稼働中は編集されない）
        let mut drones: HashMap<u32, (usize, Arc<DroneEndpoint>)> = HashMap::new();
        let mut sources: Vec<Arc<Mutex<HeatSourceModel>>> = Vec::new();
        for (index, object) in self.objects.iter().enumerate() {
            match &object.instance {
                ObjectInstance::Drone(endpoint) => {
                    drones.insert(object.id, (index, Arc::clone(endpoint)));
                }
                ObjectInstance::HeatSource(model) => sources.push(Arc::clone(model)),
                ObjectInstance::Area(_) => {}
            }
        }

        self.pump = Some(tokio::spawn(event_pump(
            events_rx,
            self.shutdown.subscribe(),
            Arc::clone(&self.viz),
            drones,
            sources,
            self.settings.heat_source.static_falloff,
        )));

        for (index, object) in self.objects.iter().enumerate() {
            let Ok(handler) = self.handler(object.kind) else {
                continue;
            };
            let ctx = WorldContext {
                object_id: object.id,
                index,
                kind_count: 0,
                settings: &self.settings,
                events: self.events_tx.clone(),
                viz: self.viz.as_ref(),
            };
            if let Err(e) = handler.start(&object.instance, &ctx) {
                error!("{} の起動に失敗しました (index: {}): {}", object.kind, index, e);
            }
        }

        self.running = true;
        info!("=== シミュレーション開始 ({} オブジェクト) ===", self.objects.len());
        Ok(())
    }

    /// 全オブジェクトの停止とイベントポンプの終了待ち
    pub async fn close_all(&mut self) {
        if !self.running {
            return;
        }
        for object in &self.objects {
            if let Ok(handler) = self.handler(object.kind) {
                handler.close(&object.instance);
            }
        }
        let _ = self.shutdown.send(true);
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }

        // 次回起動に備えてチャンネルを張り直す
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.events_tx = events_tx;
        self.events_rx = Some(events_rx);
        let (shutdown, _) = watch::channel(false);
        self.shutdown = shutdown;

        self.running = false;
        info!("=== シミュレーション停止 ===");
    }

    /// ステータス報告対象オブジェクトの現況
    pub fn status_report(&self) -> Vec<(usize, ObjectKind, BTreeMap<String, String>)> {
        self.objects
            .iter()
            .enumerate()
            .filter_map(|(index, object)| {
                let handler = self.handler(object.kind).ok()?;
                if !handler.reports_status() {
                    return None;
                }
                Some((index, object.kind, handler.status(&object.instance)))
            })
            .collect()
    }

    /// 個別オブジェクトのステータス
    pub fn object_status(&self, index: usize) -> Result<BTreeMap<String, String>, WorldError> {
        let object = self
            .objects
            .get(index)
            .ok_or(WorldError::IndexOutOfRange(index))?;
        let handler = self.handler(object.kind)?;
        Ok(handler.status(&object.instance))
    }
}

/// モデルイベントの転送ループ
///
/// 位置変更は可視化へ転送し、あわせて移動したドローンの温度読みを全熱源で
/// 更新します。色変更は現在の表示色と異なる場合のみ反映します。
async fn event_pump(
    mut events: mpsc::UnboundedReceiver<ModelEvent>,
    mut shutdown: watch::Receiver<bool>,
    viz: Arc<dyn VisualizationSink>,
    drones: HashMap<u32, (usize, Arc<DroneEndpoint>)>,
    sources: Vec<Arc<Mutex<HeatSourceModel>>>,
    static_falloff: bool,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ModelEvent::PositionChanged { object_id, position, yaw } => {
                        let Some((index, endpoint)) = drones.get(&object_id) else { continue };
                        viz.change_model_position(*index, position, yaw);
                        let Some(model) = endpoint.model() else { continue };
                        sample_heat_sources(&model, &sources, position, static_falloff);
                    }
                    ModelEvent::ColorChanged { object_id, color } => {
                        let Some((index, _)) = drones.get(&object_id) else { continue };
                        if viz.get_model_color(*index) != color {
                            viz.change_model_color(*index, color);
                        }
                    }
                }
            }
        }
    }
    debug!("イベントポンプ終了");
}

fn sample_heat_sources(
    model: &Arc<DroneModel>,
    sources: &[Arc<Mutex<HeatSourceModel>>],
    position: Position3D,
    static_falloff: bool,
) {
    for source in sources {
        let (id, temperature) = {
            let source = source.lock().unwrap();
            (
                source.id,
                source.temperature_at(position.x, position.y, static_falloff),
            )
        };
        model.set_temperature(id, temperature);
    }
}

/// ログ出力のみの可視化シンク
///
/// GUIを持たない実行形態の既定シンクです。通知内容をデバッグログへ流し、
/// 問い合わせ系のために最小限の状態ミラーを保持します。
pub struct TracingVisualization {
    models: Mutex<Vec<VizEntry>>,
}

struct VizEntry {
    kind: ObjectKind,
    position: Position3D,
    yaw: f64,
    color: ColorRgb,
}

impl TracingVisualization {
    pub fn new() -> Self {
        Self {
            models: Mutex::new(Vec::new()),
        }
    }
}

impl Default for TracingVisualization {
    fn default() -> Self {
        Self::new()
    }
}

impl VisualizationSink for TracingVisualization {
    fn add_model(
        &self,
        kind: ObjectKind,
        position: Position3D,
        heading: f64,
        has_trajectory: bool,
        color: ColorRgb,
    ) {
        debug!(
            "可視化: {} を追加 (位置: ({:.2}, {:.2}, {:.2}), 軌跡: {})",
            kind, position.x, position.y, position.z, has_trajectory
        );
        self.models.lock().unwrap().push(VizEntry {
            kind,
            position,
            yaw: heading,
            color,
        });
    }

    fn change_model_position(&self, index: usize, position: Position3D, yaw: f64) {
        let mut models = self.models.lock().unwrap();
        if let Some(entry) = models.get_mut(index) {
            entry.position = position;
            entry.yaw = yaw;
            debug!(
                "可視化: {} #{} 位置 ({:.2}, {:.2}, {:.2}) 方位 {:.0}",
                entry.kind, index, position.x, position.y, position.z, yaw
            );
        }
    }

    fn change_model_color(&self, index: usize, color: ColorRgb) {
        let mut models = self.models.lock().unwrap();
        if let Some(entry) = models.get_mut(index) {
            entry.color = color;
            debug!(
                "可視化: {} #{} 色 ({}, {}, {})",
                entry.kind, index, color.r, color.g, color.b
            );
        }
    }

    fn change_model_scale(&self, index: usize, scale: Position3D) {
        debug!(
            "可視化: #{} 寸法 ({:.2}, {:.2}, {:.2})",
            index, scale.x, scale.y, scale.z
        );
    }

    fn remove_model(&self, index: usize) {
        let mut models = self.models.lock().unwrap();
        if index < models.len() {
            models.remove(index);
            debug!("可視化: #{} を削除", index);
        }
    }

    fn get_model_color(&self, index: usize) -> ColorRgb {
        self.models
            .lock()
            .unwrap()
            .get(index)
            .map(|e| e.color)
            .unwrap_or_default()
    }

    fn get_model_position(&self, index: usize) -> Position3D {
        self.models
            .lock()
            .unwrap()
            .get(index)
            .map(|e| e.position)
            .unwrap_or_default()
    }
}

/// ライフサイクル操作のエラー
#[derive(Debug)]
pub enum WorldError {
    /// ハンドラ未登録または未知の種別
    UnknownKind(String),
    /// 範囲外のオブジェクトインデックス
    IndexOutOfRange(usize),
    /// 稼働中に許可されない編集操作
    SimulationRunning,
    /// ハンドラ内部のエラー
    Model(ModelError),
}

impl std::fmt::Display for WorldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorldError::UnknownKind(kind) => write!(f, "未知のオブジェクト種別: {}", kind),
            WorldError::IndexOutOfRange(index) => {
                write!(f, "オブジェクトインデックスが範囲外です: {}", index)
            }
            WorldError::SimulationRunning => write!(f, "シミュレーション稼働中は実行できません"),
            WorldError::Model(e) => write!(f, "モデルエラー: {}", e),
        }
    }
}

impl std::error::Error for WorldError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::area::AreaHandler;
    use crate::models::endpoint::DroneHandler;
    use crate::models::heat_source::HeatSourceHandler;
    use crate::models::traits::{
        AreaFields, DroneFields, HeatSourceFields, RgbRecord, Vec2Record, Vec3Record,
    };
    use crate::scenario::ObjectRecord;
    use std::time::Duration;

    fn test_world() -> SimulationWorld {
        let mut world = SimulationWorld::new(
            SimulationSettings::default(),
            Arc::new(TracingVisualization::new()),
        );
        world.register(Box::new(DroneHandler));
        world.register(Box::new(HeatSourceHandler));
        world.register(Box::new(AreaHandler));
        world
    }

    fn drone_fields(port: u16) -> ObjectFields {
        ObjectFields::Drone(DroneFields {
            hostname: "127.0.0.1".to_string(),
            port,
            start_position: Vec3Record::default(),
            trajectory_color: RgbRecord { r: 0, g: 255, b: 0 },
        })
    }

    #[test]
    fn test_add_update_remove_lifecycle() {
        let mut world = test_world();

        let heat = world
            .add_object(ObjectFields::HeatSource(HeatSourceFields {
                position: Vec2Record { x: 1.0, y: 1.0 },
            }))
            .unwrap();
        let area = world
            .add_object(ObjectFields::Area(AreaFields::default()))
            .unwrap();
        assert_eq!(world.object_count(), 2);

        // 更新は種別一致が前提
        world
            .update_object(
                heat,
                ObjectFields::HeatSource(HeatSourceFields {
                    position: Vec2Record { x: 2.0, y: 2.0 },
                }),
            )
            .unwrap();
        assert!(matches!(
            world.update_object(area, ObjectFields::HeatSource(HeatSourceFields::default())),
            Err(WorldError::Model(ModelError::KindMismatch { .. }))
        ));

        world.remove_object(heat).unwrap();
        assert_eq!(world.object_count(), 1);
        assert!(matches!(
            world.remove_object(5),
            Err(WorldError::IndexOutOfRange(5))
        ));
    }

    #[test]
    fn test_invalid_drone_fields_rejected() {
        let mut world = test_world();
        // ホスト名が空のドローンは追加できない
        let result = world.add_object(ObjectFields::Drone(DroneFields::default()));
        assert!(matches!(
            result,
            Err(WorldError::Model(ModelError::InvalidFields(_)))
        ));
    }

    #[test]
    fn test_status_report_covers_reporting_kinds_only() {
        let mut world = test_world();
        world.add_object(drone_fields(0)).unwrap();
        world
            .add_object(ObjectFields::HeatSource(HeatSourceFields::default()))
            .unwrap();

        let report = world.status_report();
        assert_eq!(report.len(), 1);
        let (index, kind, status) = &report[0];
        assert_eq!(*index, 0);
        assert_eq!(*kind, ObjectKind::Drone);
        // 未起動のドローンは非アーム・0V
        assert_eq!(status.get("arm").map(String::as_str), Some("false"));
        assert_eq!(status.get("power").map(String::as_str), Some("0 V."));
    }

    #[test]
    fn test_load_objects_tolerates_bad_records() {
        let mut world = test_world();
        let records = vec![
            ObjectRecord {
                kind: "missile".to_string(),
                fields: serde_yaml::Value::Null,
            },
            ObjectRecord {
                kind: "heat_source".to_string(),
                fields: serde_yaml::from_str("position: {x: 3.0, y: 4.0}").unwrap(),
            },
            ObjectRecord {
                kind: "area".to_string(),
                // 型不一致のレコードは既定値で補完される
                fields: serde_yaml::from_str("position: not_a_map").unwrap(),
            },
        ];
        world.load_objects(&records);
        assert_eq!(world.object_count(), 2);

        let exported = world.export_records();
        assert_eq!(exported.len(), 2);
        assert_eq!(exported[0].kind, "heat_source");
        assert_eq!(exported[1].kind, "area");
    }

    #[tokio::test]
    async fn test_start_all_pumps_events_to_visualization() {
        let viz = Arc::new(TracingVisualization::new());
        // 具象型のハンドルを手元に残しつつトレイトオブジェクトへ明示的に変換する
        let sink = viz.clone() as Arc<dyn VisualizationSink>;
        let mut world = SimulationWorld::new(SimulationSettings::default(), sink);
        world.register(Box::new(DroneHandler));
        world.register(Box::new(HeatSourceHandler));
        world.register(Box::new(AreaHandler));

        let drone = world.add_object(drone_fields(0)).unwrap();
        world
            .add_object(ObjectFields::HeatSource(HeatSourceFields {
                position: Vec2Record { x: 0.0, y: 0.0 },
            }))
            .unwrap();

        world.start_all().unwrap();
        assert!(world.is_running());
        assert!(matches!(
            world.add_object(ObjectFields::Area(AreaFields::default())),
            Err(WorldError::SimulationRunning)
        ));

        // 起動直後の初期状態イベントがポンプ経由で可視化へ届く
        tokio::time::sleep(Duration::from_millis(100)).await;
        let position = viz.get_model_position(drone);
        assert_eq!(position, Position3D::default());

        // ドローンは熱源直上から出発するため温度読みは最高温度になる
        let report = world.object_status(drone).unwrap();
        assert_eq!(report.get("arm").map(String::as_str), Some("false"));

        world.close_all().await;
        assert!(!world.is_running());

        // 停止後は編集も再起動も可能
        world
            .add_object(ObjectFields::Area(AreaFields::default()))
            .unwrap();
        world.start_all().unwrap();
        world.close_all().await;
    }
}
