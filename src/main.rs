//! certflow 証明書リクエスト管理コマンドラインツール

use anyhow::{anyhow, bail, Context, Result};
use certflow::config::{CertflowConfig, ConfigLoader};
use certflow::identity::{AuthFailure, Credential, Identity, IdentityStore};
use certflow::lifecycle::{
    certificate_parameters, ExtendedKeyUsage, KeyUsage, LifecycleEngine, RequestId,
    RevocationReason, SubjectInfo,
};
use certflow::logging::init_logging;
use certflow::runtime::{reconcile_loop, Runtime};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "certflow")]
#[command(about = "Certificate request lifecycle: submit, review, issue and revoke")]
#[command(version)]
struct Cli {
    /// 設定ファイル
    #[arg(short, long, global = true, env = "CERTFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// ユーザー名
    #[arg(short, long, global = true, env = "CERTFLOW_USER")]
    user: Option<String>,

    /// パスワード
    #[arg(long, global = true, env = "CERTFLOW_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// APIキー
    #[arg(long, global = true, env = "CERTFLOW_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// サンプル設定ファイルを生成
    InitConfig {
        #[arg(short, long, default_value = "certflow.toml")]
        output: PathBuf,

        /// 既存ファイルを上書き
        #[arg(long)]
        force: bool,
    },

    /// 指定可能な Key Usage / Extended Key Usage を表示
    Params,

    /// 証明書を申請
    Submit {
        #[arg(long)]
        common_name: String,

        #[arg(long)]
        organization: Option<String>,

        /// 2文字の国コード
        #[arg(long)]
        country: Option<String>,

        #[arg(long)]
        ip_address: Option<String>,

        /// 例: DigitalSignature（複数指定可）
        #[arg(long = "key-usage", value_parser = parse_key_usage)]
        key_usages: Vec<KeyUsage>,

        /// 例: ClientAuth（複数指定可）
        #[arg(long = "ext-key-usage", value_parser = parse_ext_key_usage)]
        extended_key_usages: Vec<ExtendedKeyUsage>,

        #[arg(long)]
        is_ca: bool,

        #[arg(long, default_value_t = 365)]
        validity_days: u32,
    },

    /// 承認して発行（管理者）
    Approve { id: RequestId },

    /// 却下（管理者）
    Reject { id: RequestId },

    /// 失効（管理者）
    Revoke {
        id: RequestId,

        #[arg(long, default_value = "unspecified")]
        reason: RevocationReason,
    },

    /// 承認済みリクエストの発行を再試行（管理者）
    Issue { id: RequestId },

    /// リクエストを表示
    Show { id: RequestId },

    /// 自分のリクエスト一覧
    ListMine,

    /// 審査待ち一覧（管理者）
    ListPending,

    /// 全リクエスト一覧（管理者）
    ListAll,

    /// 失効済み証明書一覧（管理者）
    Crl,

    /// シリアル番号で証明書を検証
    Verify { serial: String },

    /// 発行が滞留したリクエストを再処理（管理者）
    Reconcile {
        /// 指定秒ごとに繰り返す（Ctrl-Cで停止）
        #[arg(long)]
        watch: Option<u64>,
    },
}

fn parse_key_usage(s: &str) -> std::result::Result<KeyUsage, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown key usage: {}", s))
}

fn parse_ext_key_usage(s: &str) -> std::result::Result<ExtendedKeyUsage, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown extended key usage: {}", s))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn credential(cli: &Cli) -> Result<Credential> {
    if let Some(ref key) = cli.api_key {
        return Ok(Credential::api_key(key.clone()));
    }
    match (&cli.user, &cli.password) {
        (Some(user), Some(password)) => Ok(Credential::password(user.clone(), password.clone())),
        _ => bail!("credentials required: --user/--password or --api-key"),
    }
}

async fn authenticate(cli: &Cli, runtime: &Runtime) -> Result<Identity> {
    let credential = credential(cli)?;
    Ok(runtime.identities.resolve(&credential).await?)
}

fn load_config(cli: &Cli) -> Result<CertflowConfig> {
    ConfigLoader::new()
        .load_from_file(cli.config.clone())
        .load_from_env()
        .build()
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::InitConfig { ref output, force } => {
            if output.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", output.display());
            }
            let sample = CertflowConfig::sample_toml()?;
            std::fs::write(output, sample)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            eprintln!("wrote {}", output.display());
            return Ok(());
        }
        Commands::Params => return print_json(&certificate_parameters()),
        _ => {}
    }

    let config = load_config(&cli)?;
    let _guard = init_logging(&config.logging)?;
    let runtime = Runtime::assemble(&config).await?;
    let identity = authenticate(&cli, &runtime).await?;
    let engine = &runtime.engine;

    let outcome = dispatch(cli.command, engine, &identity).await;

    // 書き込み中の監査記録を待ってから終了する
    engine.drain().await;
    outcome
}

async fn dispatch(command: Commands, engine: &LifecycleEngine, identity: &Identity) -> Result<()> {
    match command {
        Commands::InitConfig { .. } | Commands::Params => Ok(()),
        Commands::Submit {
            common_name,
            organization,
            country,
            ip_address,
            key_usages,
            extended_key_usages,
            is_ca,
            validity_days,
        } => {
            let mut subject = SubjectInfo::new(common_name);
            subject.organization = organization;
            subject.country = country;
            subject.ip_address = ip_address;
            if !key_usages.is_empty() {
                subject.key_usages = key_usages;
            }
            if !extended_key_usages.is_empty() {
                subject.extended_key_usages = extended_key_usages;
            }
            subject.is_ca = is_ca;
            subject.validity_days = validity_days;

            let id = engine.submit_request(identity, subject).await?;
            print_json(&engine.get_request(identity, id).await?)
        }
        Commands::Approve { id } => print_json(&engine.approve(identity, id).await?),
        Commands::Reject { id } => print_json(&engine.reject(identity, id).await?),
        Commands::Revoke { id, reason } => {
            print_json(&engine.revoke_with_reason(identity, id, reason).await?)
        }
        Commands::Issue { id } => print_json(&engine.issue(identity, id).await?),
        Commands::Show { id } => print_json(&engine.get_request(identity, id).await?),
        Commands::ListMine => print_json(&engine.list_mine(identity).await?),
        Commands::ListPending => print_json(&engine.list_pending(identity).await?),
        Commands::ListAll => print_json(&engine.list_all(identity).await?),
        Commands::Crl => print_json(&engine.revocation_list(identity).await?),
        Commands::Verify { ref serial } => {
            print_json(&engine.verify_certificate(identity, serial).await?)
        }
        Commands::Reconcile { watch: None } => {
            let report = engine.reconcile_stuck(identity).await?;
            print_json(&report)?;
            if !report.is_clean() {
                return Err(anyhow!(
                    "{} request(s) remain approved without a certificate",
                    report.unresolved.len()
                ));
            }
            Ok(())
        }
        Commands::Reconcile { watch: Some(secs) } => {
            let token = CancellationToken::new();
            let ctrl_c = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.cancel();
                }
            });

            reconcile_loop(engine, identity, Duration::from_secs(secs), token, |report| {
                if let Ok(line) = serde_json::to_string(report) {
                    println!("{}", line);
                }
            })
            .await?;
            Ok(())
        }
    }
}

/// エラーから終了コードを決定
fn exit_code(error: &anyhow::Error) -> i32 {
    if let Some(e) = error.downcast_ref::<certflow::LifecycleError>() {
        return e.kind().exit_code();
    }
    if let Some(e) = error.downcast_ref::<certflow::Error>() {
        return e.exit_code();
    }
    if error.downcast_ref::<AuthFailure>().is_some() {
        return certflow::ErrorKind::Unauthorized.exit_code();
    }
    1
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {:#}", e);
            exit_code(&e)
        }
    };
    std::process::exit(code);
}
