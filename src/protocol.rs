//! # Protocol モジュール
//!
//! 地上局とシミュレートされた機体との間のUDPワイヤプロトコルを定義します。
//!
//! メッセージは `bincode`（serde連携）でエンコードされた小さなフレームで、
//! 実機プロトコルのうちシミュレーションが実際に使用するメッセージ種別のみを
//! 再現します。ビット互換は目的としません。
//!
//! ## コンポーネントID
//!
//! - `26`: 機体本体（テレメトリ・コマンド応答）
//! - `1`: 位置指令のエコー応答

use serde::{Deserialize, Serialize};

/// 機体本体のコンポーネントID
pub const VEHICLE_COMPONENT: u8 = 26;
/// 位置指令エコーのコンポーネントID
pub const COMMAND_ECHO_COMPONENT: u8 = 1;

/// RCチャンネルのニュートラル値
pub const RC_NEUTRAL: u16 = 1500;

/// 機体への個別コマンド
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum VehicleCommand {
    /// アーム/ディスアームのトグル（実機は同一コマンドで両方を扱う）
    ArmDisarmToggle,
    /// 離陸
    Takeoff,
    /// 着陸
    Land,
    /// LEDインジケータの色設定
    SetIndicatorColor { r: u8, g: u8, b: u8 },
}

/// コマンド種別（応答メッセージでの識別用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    ArmDisarmToggle,
    Takeoff,
    Land,
    SetIndicatorColor,
}

impl VehicleCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            VehicleCommand::ArmDisarmToggle => CommandKind::ArmDisarmToggle,
            VehicleCommand::Takeoff => CommandKind::Takeoff,
            VehicleCommand::Land => CommandKind::Land,
            VehicleCommand::SetIndicatorColor { .. } => CommandKind::SetIndicatorColor,
        }
    }
}

/// 地上局から機体への受信メッセージ
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GroundMessage {
    /// 個別コマンド
    Command(VehicleCommand),
    /// ローカル座標系の位置指令
    GoToLocalPoint { x: f64, y: f64, z: f64, yaw: f64 },
    /// RCチャンネルオーバーライド（4チャンネル、1500中立）
    RcOverride { ch1: u16, ch2: u16, ch3: u16, ch4: u16 },
}

/// コマンド応答の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckResult {
    /// 受理
    Accepted,
    /// 実行中
    InProgress,
    /// 拒否
    Denied,
}

/// 距離センサーの仮想チャンネル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorChannel {
    /// 温度（汎用チャンネルに温度値を載せる）
    Temperature,
    /// レーザー測距（高度）
    LaserHeight,
}

/// 機体から地上局への送信メッセージ
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum VehicleMessage {
    /// 死活監視
    Heartbeat,
    /// ローカル位置
    LocalPosition { time_s: u64, x: f64, y: f64, z: f64 },
    /// 到達ウェイポイント数（単調増加）
    WaypointReached { seq: u32 },
    /// 距離センサー値
    DistanceSensor { channel: SensorChannel, value: f64 },
    /// コマンド応答
    CommandAck { command: CommandKind, result: AckResult },
    /// 位置指令のエコー
    PositionTargetEcho { x: f64, y: f64, z: f64, yaw: f64 },
}

/// 機体発フレーム（コンポーネントID付き）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleFrame {
    pub component: u8,
    pub message: VehicleMessage,
}

/// プロトコルエラー
#[derive(Debug)]
pub enum ProtocolError {
    Encode(bincode::error::EncodeError),
    Decode(bincode::error::DecodeError),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Encode(e) => write!(f, "エンコード失敗: {}", e),
            ProtocolError::Decode(e) => write!(f, "デコード失敗: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// 機体発メッセージをフレームとしてエンコード
pub fn encode_vehicle(component: u8, message: &VehicleMessage) -> Result<Vec<u8>, ProtocolError> {
    let frame = VehicleFrame {
        component,
        message: *message,
    };
    bincode::serde::encode_to_vec(frame, bincode::config::standard()).map_err(ProtocolError::Encode)
}

/// 機体発フレームをデコード（テスト・地上局側で使用）
pub fn decode_vehicle(buf: &[u8]) -> Result<VehicleFrame, ProtocolError> {
    let (frame, _) = bincode::serde::decode_from_slice(buf, bincode::config::standard())
        .map_err(ProtocolError::Decode)?;
    Ok(frame)
}

/// 地上局発メッセージをエンコード（テスト・地上局側で使用）
pub fn encode_ground(message: &GroundMessage) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(*message, bincode::config::standard())
        .map_err(ProtocolError::Encode)
}

/// 地上局発メッセージをデコード
pub fn decode_ground(buf: &[u8]) -> Result<GroundMessage, ProtocolError> {
    let (message, _) = bincode::serde::decode_from_slice(buf, bincode::config::standard())
        .map_err(ProtocolError::Decode)?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ground_message_round_trip() {
        let msg = GroundMessage::GoToLocalPoint {
            x: 1.0,
            y: 2.0,
            z: 1.5,
            yaw: 90.0,
        };
        let buf = encode_ground(&msg).unwrap();
        assert_eq!(decode_ground(&buf).unwrap(), msg);
    }

    #[test]
    fn test_vehicle_frame_carries_component() {
        let msg = VehicleMessage::CommandAck {
            command: CommandKind::Takeoff,
            result: AckResult::InProgress,
        };
        let buf = encode_vehicle(VEHICLE_COMPONENT, &msg).unwrap();
        let frame = decode_vehicle(&buf).unwrap();
        assert_eq!(frame.component, VEHICLE_COMPONENT);
        assert_eq!(frame.message, msg);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_ground(&[0xff, 0xfe, 0xfd]).is_err());
    }
}
