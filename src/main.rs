mod logging;
mod models;
mod protocol;
mod scenario;
mod simulation;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, Command};
use tracing::{error, info};

use logging::{init_logging, level_for_verbosity, LogConfig, LogOutput};
use models::area::AreaHandler;
use models::endpoint::DroneHandler;
use models::heat_source::HeatSourceHandler;
use scenario::ScenarioConfig;
use simulation::{SimulationWorld, TracingVisualization};

/// 稼働中のステータスログ出力間隔
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

fn main() {
    // コマンドライン引数の解析
    let matches = Command::new("dronesim")
        .version("0.1.0")
        .about("スワームドローンシミュレータ (Swarm Drone Simulator)")
        .long_about(
            "地上管制ソフトウェアのテスト用ドローンシミュレータ\n\
             シナリオに記述した各機体ごとにUDPエンドポイントを開き、\n\
             コマンド受信・物理モデル・テレメトリ送信を再現します。",
        )
        .arg(
            Arg::new("scenario")
                .short('s')
                .long("scenario")
                .value_name("FILE")
                .help("シナリオファイル(.yaml)のパスを指定")
                .long_help(
                    "実行するシナリオファイル(.yaml)のパスを指定します。\n\
                     指定しない場合、使用方法を表示して終了します。",
                ),
        )
        .arg(
            Arg::new("info")
                .short('i')
                .long("info")
                .action(clap::ArgAction::SetTrue)
                .help("シナリオの情報のみ表示して終了"),
        )
        .arg(
            Arg::new("export")
                .short('e')
                .long("export")
                .value_name("FILE")
                .help("読み込んだシナリオを正規化して書き出し、実行せずに終了")
                .long_help(
                    "シナリオを読み込んだ後、各オブジェクトの設定レコードを\n\
                     正規化したYAMLとして書き出して終了します。",
                ),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::Count)
                .help("詳細出力レベル (-v: デバッグ, -vv: トレース)"),
        )
        .arg(
            Arg::new("log-output")
                .long("log-output")
                .value_name("DEST")
                .default_value("console")
                .help("ログ出力先 (console, file, both)"),
        )
        .get_matches();

    println!("スワームドローンシミュレータ - dronesim v0.1.0");
    println!();

    let verbose_level = matches.get_count("verbose");
    let log_output = matches
        .get_one::<String>("log-output")
        .map(String::as_str)
        .unwrap_or("console");
    let log_output = match LogOutput::from_str(log_output) {
        Ok(output) => output,
        Err(e) => {
            eprintln!("エラー: {}", e);
            std::process::exit(1);
        }
    };

    let log_config = LogConfig {
        level: level_for_verbosity(verbose_level),
        output: log_output,
        ..LogConfig::default()
    };
    if let Err(e) = init_logging(log_config) {
        eprintln!("ログ初期化に失敗しました: {}", e);
        std::process::exit(1);
    }

    // シナリオファイルの処理
    if let Some(scenario_path) = matches.get_one::<String>("scenario") {
        let export = matches.get_one::<String>("export").cloned();
        match run_scenario(scenario_path, matches.get_flag("info"), export) {
            Ok(_) => {
                info!("シナリオ実行が正常に完了しました");
            }
            Err(e) => {
                eprintln!("エラー: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        show_default_help();
    }
}

/// シナリオファイルを読み込んで実行
fn run_scenario(
    scenario_path: &str,
    info_only: bool,
    export: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = ScenarioConfig::from_file(scenario_path)?;
    info!("シナリオファイル読み込み完了: {}", scenario_path);

    scenario.print_summary();
    println!();

    // 情報表示のみの場合
    if info_only {
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(execute_scenario(scenario, export))?;

    Ok(())
}

/// シナリオの実行
///
/// Ctrl-Cを受けるまで稼働し、一定間隔でステータス報告対象オブジェクトの
/// 現況をログに出します。
async fn execute_scenario(
    scenario: ScenarioConfig,
    export: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let viz = Arc::new(TracingVisualization::new());
    let mut world = SimulationWorld::new(scenario.simulation.clone(), viz);
    world.register(Box::new(DroneHandler));
    world.register(Box::new(HeatSourceHandler));
    world.register(Box::new(AreaHandler));

    world.load_objects(&scenario.objects);
    if world.object_count() == 0 {
        error!("シナリオに有効なオブジェクトがありません");
        return Ok(());
    }

    // 書き出しモード: ハンドラで正規化したレコードを保存して終了
    if let Some(path) = export {
        let normalized = ScenarioConfig {
            meta: scenario.meta.clone(),
            simulation: world.settings().clone(),
            objects: world.export_records(),
        };
        normalized.save_to_file(&path)?;
        info!("正規化したシナリオを書き出しました: {}", path);
        return Ok(());
    }

    world.start_all()?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("停止シグナルを受信しました");
                break;
            }
            _ = tokio::time::sleep(STATUS_INTERVAL) => {
                for (index, kind, status) in world.status_report() {
                    let summary: Vec<String> = status
                        .iter()
                        .map(|(key, value)| format!("{}: {}", key, value))
                        .collect();
                    info!("{} #{} [{}]", kind, index, summary.join(", "));
                }
            }
        }
    }

    world.close_all().await;
    Ok(())
}

/// デフォルトヘルプを表示
fn show_default_help() {
    println!("使用方法:");
    println!("  dronesim [オプション]");
    println!();
    println!("オプション:");
    println!("  -s, --scenario <FILE>  シナリオファイルを指定して実行");
    println!("  -i, --info             シナリオ情報のみ表示");
    println!("  -e, --export <FILE>    正規化したシナリオを書き出して終了");
    println!("  -v, --verbose          詳細出力 (複数指定で詳細レベル上昇)");
    println!("      --log-output <DEST> ログ出力先 (console, file, both)");
    println!("  -h, --help             このヘルプを表示");
    println!();
    println!("例:");
    println!("  dronesim -s scenarios/two_drones.yaml");
    println!("  dronesim -s scenarios/two_drones.yaml -v --log-output both");
    println!("  dronesim -s scenarios/two_drones.yaml -i");
}
