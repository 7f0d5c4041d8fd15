use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// シナリオメタデータ
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScenarioMeta {
    pub version: String,
    pub name: String,
    pub description: String,
}

impl Default for ScenarioMeta {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            name: "無題のシナリオ".to_string(),
            description: String::new(),
        }
    }
}

/// ドローン共通設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DroneSettings {
    /// 移動速度（ステップ/秒）
    pub speed: f64,
    /// テレメトリ1巡の周期（秒）
    pub heartbeat_rate: f64,
    /// バッテリーシミュレーションの有効化
    pub battery_need: bool,
    /// バッテリー容量（mAh）
    pub battery_capacity: f64,
    /// 満充電時の電圧（V）
    pub battery_max: f64,
    /// 強制着陸する遮断電圧（V）
    pub battery_off: f64,
}

impl Default for DroneSettings {
    fn default() -> Self {
        Self {
            speed: 60.0,
            heartbeat_rate: 0.1,
            battery_need: true,
            battery_capacity: 1300.0,
            battery_max: 7.2,
            battery_off: 6.6,
        }
    }
}

/// 熱源共通設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeatSourceSettings {
    /// trueなら半径内一律の最高温度、falseなら距離による線形減衰
    #[serde(rename = "static")]
    pub static_falloff: bool,
    /// 有効半径（空間ユニット）
    pub radius: f64,
    /// 半径外の最低温度（℃）
    pub min_temp: f64,
    /// 中心の最高温度（℃）
    pub max_temp: f64,
}

impl Default for HeatSourceSettings {
    fn default() -> Self {
        Self {
            static_falloff: true,
            radius: 0.5,
            min_temp: 20.0,
            max_temp: 60.0,
        }
    }
}

/// シミュレーション設定
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub drone: DroneSettings,
    pub heat_source: HeatSourceSettings,
}

/// オブジェクト1件の永続化レコード
///
/// `fields` の内容は種別ごとのハンドラが解釈します。欠損フィールドは
/// ハンドラ側で既定値に補完されます。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObjectRecord {
    pub kind: String,
    #[serde(default)]
    pub fields: serde_yaml::Value,
}

/// 完全なシナリオ設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub meta: ScenarioMeta,
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub objects: Vec<ObjectRecord>,
}

impl ScenarioConfig {
    /// YAMLファイルからシナリオ設定を読み込み
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ScenarioError> {
        let path = path.as_ref();

        // ファイル存在チェック
        if !path.exists() {
            return Err(ScenarioError::FileNotFound(path.to_path_buf()));
        }

        // ファイル読み込み
        let contents = fs::read_to_string(path)
            .map_err(|e| ScenarioError::IoError(path.to_path_buf(), e))?;

        // YAML解析
        let config: ScenarioConfig = serde_yaml::from_str(&contents)
            .map_err(|e| ScenarioError::ParseError(path.to_path_buf(), e))?;

        // 基本的な検証
        config.validate()?;

        Ok(config)
    }

    /// シナリオ設定をYAMLファイルへ保存
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ScenarioError> {
        let path = path.as_ref();
        let contents = serde_yaml::to_string(self)
            .map_err(|e| ScenarioError::ParseError(path.to_path_buf(), e))?;
        fs::write(path, contents).map_err(|e| ScenarioError::IoError(path.to_path_buf(), e))
    }

    /// 設定の基本的な検証
    pub fn validate(&self) -> Result<(), ScenarioError> {
        let drone = &self.simulation.drone;
        if drone.speed <= 0.0 {
            return Err(ScenarioError::ValidationError(
                "drone.speed must be positive".to_string(),
            ));
        }
        if drone.heartbeat_rate <= 0.0 {
            return Err(ScenarioError::ValidationError(
                "drone.heartbeat_rate must be positive".to_string(),
            ));
        }
        if drone.battery_capacity <= 0.0 {
            return Err(ScenarioError::ValidationError(
                "drone.battery_capacity must be positive".to_string(),
            ));
        }
        if drone.battery_off >= drone.battery_max {
            return Err(ScenarioError::ValidationError(format!(
                "battery_off {} must be below battery_max {}",
                drone.battery_off, drone.battery_max
            )));
        }

        let heat = &self.simulation.heat_source;
        if heat.radius <= 0.0 {
            return Err(ScenarioError::ValidationError(
                "heat_source.radius must be positive".to_string(),
            ));
        }
        if heat.min_temp > heat.max_temp {
            return Err(ScenarioError::ValidationError(format!(
                "heat_source.min_temp {} must not exceed max_temp {}",
                heat.min_temp, heat.max_temp
            )));
        }

        Ok(())
    }

    /// 種別ごとのオブジェクト数
    fn count_kind(&self, kind: &str) -> usize {
        self.objects.iter().filter(|o| o.kind == kind).count()
    }

    /// シナリオの概要を表示
    pub fn print_summary(&self) {
        println!("=== シナリオ情報 ===");
        println!("名前: {}", self.meta.name);
        println!("説明: {}", self.meta.description);
        println!("バージョン: {}", self.meta.version);
        println!();

        println!("=== シミュレーション設定 ===");
        println!("ドローン速度: {:.1}ステップ/秒", self.simulation.drone.speed);
        println!("テレメトリ周期: {:.2}秒", self.simulation.drone.heartbeat_rate);
        println!(
            "バッテリー: {} (容量: {:.0}mAh, 遮断電圧: {:.1}V)",
            if self.simulation.drone.battery_need {
                "有効"
            } else {
                "無効"
            },
            self.simulation.drone.battery_capacity,
            self.simulation.drone.battery_off,
        );
        println!(
            "熱源: {} (半径: {:.1}, {:.1}〜{:.1}℃)",
            if self.simulation.heat_source.static_falloff {
                "静的"
            } else {
                "減衰"
            },
            self.simulation.heat_source.radius,
            self.simulation.heat_source.min_temp,
            self.simulation.heat_source.max_temp,
        );
        println!();

        println!("=== オブジェクト ===");
        println!("ドローン: {}機", self.count_kind("drone"));
        println!("熱源: {}基", self.count_kind("heat_source"));
        println!("装飾エリア: {}面", self.count_kind("area"));
    }
}

/// シナリオ読み込みエラー
#[derive(Debug)]
pub enum ScenarioError {
    FileNotFound(std::path::PathBuf),
    IoError(std::path::PathBuf, std::io::Error),
    ParseError(std::path::PathBuf, serde_yaml::Error),
    ValidationError(String),
}

impl std::fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioError::FileNotFound(path) => {
                write!(f, "シナリオファイルが見つかりません: {}", path.display())
            }
            ScenarioError::IoError(path, err) => {
                write!(f, "ファイル読み込みエラー {}: {}", path.display(), err)
            }
            ScenarioError::ParseError(path, err) => {
                write!(f, "YAML解析エラー {}: {}", path.display(), err)
            }
            ScenarioError::ValidationError(msg) => {
                write!(f, "設定検証エラー: {}", msg)
            }
        }
    }
}

impl std::error::Error for ScenarioError {}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
meta:
  version: "1.0"
  name: "テストシナリオ"
  description: "2機+熱源1基"
simulation:
  drone:
    speed: 120.0
    battery_need: false
  heat_source:
    static: false
    radius: 1.0
objects:
  - kind: drone
    fields:
      hostname: "127.0.0.1"
      port: 8001
  - kind: drone
    fields:
      hostname: "127.0.0.1"
      port: 8002
  - kind: heat_source
    fields:
      position: {x: 2.0, y: 2.0}
"#;

    #[test]
    fn test_parse_sample_scenario() {
        let config: ScenarioConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.meta.name, "テストシナリオ");
        assert_eq!(config.objects.len(), 3);
        assert_eq!(config.count_kind("drone"), 2);

        // 明示された値は上書き、残りは既定値
        assert_eq!(config.simulation.drone.speed, 120.0);
        assert!(!config.simulation.drone.battery_need);
        assert_eq!(config.simulation.drone.heartbeat_rate, 0.1);
        assert!(!config.simulation.heat_source.static_falloff);
        assert_eq!(config.simulation.heat_source.max_temp, 60.0);
    }

    #[test]
    fn test_defaults_from_minimal_scenario() {
        let config: ScenarioConfig = serde_yaml::from_str("objects: []").unwrap();
        config.validate().unwrap();
        assert_eq!(config.simulation.drone.speed, 60.0);
        assert_eq!(config.simulation.drone.battery_max, 7.2);
        assert_eq!(config.simulation.drone.battery_off, 6.6);
        assert!(config.simulation.heat_source.static_falloff);
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let mut config: ScenarioConfig = serde_yaml::from_str("objects: []").unwrap();
        config.simulation.drone.speed = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ScenarioError::ValidationError(_))
        ));

        let mut config: ScenarioConfig = serde_yaml::from_str("objects: []").unwrap();
        config.simulation.drone.battery_off = 8.0;
        assert!(config.validate().is_err());

        let mut config: ScenarioConfig = serde_yaml::from_str("objects: []").unwrap();
        config.simulation.heat_source.min_temp = 100.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload_file() {
        let config: ScenarioConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let path = std::env::temp_dir().join("dronesim_scenario_save_test.yaml");
        config.save_to_file(&path).unwrap();

        let reloaded = ScenarioConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(reloaded.objects.len(), 3);
        assert_eq!(reloaded.simulation.drone.speed, 120.0);
        assert_eq!(reloaded.meta.name, "テストシナリオ");
    }

    #[test]
    fn test_round_trip_preserves_objects() {
        let config: ScenarioConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let text = serde_yaml::to_string(&config).unwrap();
        let reparsed: ScenarioConfig = serde_yaml::from_str(&text).unwrap();
        assert_eq!(reparsed.objects.len(), 3);
        assert_eq!(reparsed.objects[2].kind, "heat_source");
    }
}
