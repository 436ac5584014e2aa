mod cli;
mod ui;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cli::{Cli, Command, MachineArg};
use ui::StepProgress;
use vmflow::config::OrchestratorConfig;
use vmflow::context::CallContext;
use vmflow::model::{Account, Entity, HypervisorType, OwnerRef, VolumeFormat};
use vmflow::orchestrator::{CreateVmSnapshot, NewVolume};
use vmflow::sim::{SimOp, SimulatedCloud, SimulatedHypervisor};
use vmflow::state_machine::{vm_snapshot_machine, volume_machine};

const GIB: u64 = 1 << 30;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::load_from(path)?,
        None => OrchestratorConfig::load()?,
    };
    if let Some(workers) = cli.workers {
        config.worker_count = workers;
        config.validate()?;
    }
    init_tracing(&config, cli.verbose);

    match cli.command {
        Command::Demo { inject_failure } => run_demo(config, inject_failure).await,
        Command::Transitions { machine, json } => {
            match machine {
                MachineArg::Volume => ui::print_transitions(volume_machine(), json),
                MachineArg::VmSnapshot => ui::print_transitions(vm_snapshot_machine(), json),
            }
            Ok(())
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// `RUST_LOG` tem precedência; `--verbose` liga debug para o crate.
fn init_tracing(config: &OrchestratorConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("vmflow=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Percorre os fluxos principais sobre o hypervisor simulado.
async fn run_demo(config: OrchestratorConfig, inject_failure: bool) -> Result<()> {
    let hypervisor = SimulatedHypervisor::new().with_latency(Duration::from_millis(300));
    let cloud = SimulatedCloud::with_hypervisor(config.clone(), hypervisor);
    cloud.add_vm(7, "web-7", 1, HypervisorType::Kvm);
    let ctx = CallContext::new(Account::user(1, "alice"));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let reconciler = cloud.reconciler.clone().spawn(config.reconcile_interval(), shutdown_rx);

    // Volume anexado à VM 7.
    let volume = cloud
        .volume_ops
        .allocate(&ctx, NewVolume::new("data", 10 * GIB, VolumeFormat::Qcow2).attached_to(7))?;
    if inject_failure {
        cloud.hypervisor.fail_next(SimOp::CreateVolume);
        let step = StepProgress::start("criando volume (falha injetada)");
        let result = cloud.volume_ops.create(&ctx, volume.id).await;
        step.finish(&result, |v| format!("volume {} em {}", v.id, v.state()));
    }
    let step = StepProgress::start("criando volume");
    let result = cloud.volume_ops.create(&ctx, volume.id).await;
    step.finish(&result, |v| format!("volume {} em {} no pool {:?}", v.id, v.state(), v.pool_id));

    let step = StepProgress::start("redimensionando volume para 20 GiB");
    let result = cloud.volume_ops.resize(&ctx, volume.id, 20 * GIB, false).await;
    step.finish(&result, |v| format!("volume {} com {} bytes", v.id, v.size_bytes));

    // Snapshots da VM 7.
    for request in [
        CreateVmSnapshot::disk("base").describe("antes da atualização"),
        CreateVmSnapshot::disk("live").with_memory().quiesced(),
    ] {
        let step = StepProgress::start(&format!("snapshot {}", request.name));
        let result = cloud.vm_snapshots.create(&ctx, 7, request).await;
        step.finish(&result, |s| format!("snapshot {} ({}) em {}", s.id, s.name, s.state()));
    }

    if let Some(base) = cloud
        .vm_snapshots
        .snapshots()
        .list_by_owner(OwnerRef::vm(7))
        .into_iter()
        .find(|s| s.name == "base")
    {
        let step = StepProgress::start("revertendo para base");
        let result = cloud.vm_snapshots.revert(&ctx, base.id).await;
        step.finish(&result, |vm| format!("vm {} agora {}", vm.id, vm.power_state));
    }

    let step = StepProgress::start("removendo todos os snapshots da vm 7");
    let result = cloud.vm_snapshots.delete_all(&ctx, 7).await;
    step.finish(&result, |n| format!("{n} snapshots removidos"));

    // Volume avulso: destroy e expunge.
    let scratch = cloud
        .volume_ops
        .allocate(&ctx, NewVolume::new("scratch", GIB, VolumeFormat::Raw))?;
    let step = StepProgress::start("criando e destruindo volume avulso");
    let result = scratch_lifecycle(&cloud, &ctx, scratch.id).await;
    step.finish(&result, |_| format!("volume {} expurgado", scratch.id));

    let report = cloud.reconciler.reconcile_all().await;
    let _ = shutdown.send(true);
    reconciler.await?;

    ui::print_json("Reconciliação", &report);
    ui::print_json("Uso", &cloud.usage.records());
    ui::print_json("Work items", &cloud.queue.items().stats());
    Ok(())
}

async fn scratch_lifecycle(
    cloud: &SimulatedCloud,
    ctx: &CallContext,
    volume_id: u64,
) -> vmflow::error::Result<bool> {
    cloud.volume_ops.create(ctx, volume_id).await?;
    cloud.volume_ops.destroy(ctx, volume_id).await?;
    cloud.volume_ops.expunge(ctx, volume_id).await
}
