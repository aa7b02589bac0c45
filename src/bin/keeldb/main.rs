use anyhow::Result;
use clap::Parser;
use env_logger::{Builder, Env};
use log::error;

mod cli;
mod util;
mod cmd_init;
mod cmd_status;
mod cmd_journal;
mod cmd_checkpoint;
mod cmd_upgrade;
mod cmd_recover;
mod cmd_cluster;
mod cmd_keygen;

fn init_logger() {
    // Уровень берём из RUST_LOG, иначе дефолт — info.
    // Пример: RUST_LOG=debug ./keeldb ...
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    if let Err(e) = run() {
        if KeelDB::is_catastrophic(&e) {
            error!("CATASTROPHIC: {:#}", e);
            std::process::exit(2);
        }
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse();
    match cli.cmd {
        cli::Cmd::Init { path, storage, page_size, encrypted } =>
            cmd_init::exec(path, storage, page_size, encrypted),

        cli::Cmd::Status { path, json } =>
            cmd_status::exec(path, json),

        cli::Cmd::VerifyJournal { path, json } =>
            cmd_journal::exec_verify(path, json),

        cli::Cmd::Checkpoint { path } =>
            cmd_checkpoint::exec(path),

        cli::Cmd::Upgrade { path } =>
            cmd_upgrade::exec(path),

        cli::Cmd::Recover { path, out, json } =>
            cmd_recover::exec(path, out, json),

        cli::Cmd::WhoseTask { record, key, mentor, state, shard } =>
            cmd_cluster::exec_whose_task(record, key, mentor, state, shard),

        cli::Cmd::Destinations { record, node, state, json } =>
            cmd_cluster::exec_destinations(record, node, state, json),

        cli::Cmd::Bucket { id, record } =>
            cmd_cluster::exec_bucket(id, record),

        cli::Cmd::Keygen { kid } =>
            cmd_keygen::exec(kid),
    }
}
