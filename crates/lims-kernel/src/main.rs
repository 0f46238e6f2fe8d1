use anyhow::{Context, Result};
use chrono::Utc;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use lims_conformity::{
    evaluate_detailed, sanitize_input, InMemoryCatalog, MeasuredValue, Parameter, ParameterCategory,
    ParameterId, Role, SampleTypeId, Specification, TestCategory,
};
use lims_kernel::master::InMemoryMasterData;
use lims_kernel::telemetry::init_tracing;
use lims_kernel::{
    Actor, AdvanceOutcome, BroadcastNotifier, EngineConfig, InMemoryCredentials, LabKernel, MemoryStore,
    OrganizationId, PlantId, RegisterSample, SampleDossier,
};
use std::path::PathBuf;
use std::sync::Arc;

const DEMO_PASSWORD: &str = "demo-password";

fn cli() -> Command {
    Command::new("lims-kernel")
        .version(lims_kernel::VERSION)
        .about("Sample analytical lifecycle & conformity engine")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Engine configuration (TOML)"),
        )
        .subcommand(
            Command::new("evaluate")
                .about("Evaluate one value against numeric limits")
                .arg(
                    Arg::new("value")
                        .long("value")
                        .required(true)
                        .allow_hyphen_values(true)
                        .help("Measured value, decimal comma accepted"),
                )
                .arg(
                    Arg::new("min")
                        .long("min")
                        .allow_negative_numbers(true)
                        .value_parser(value_parser!(f64))
                        .help("Lower limit"),
                )
                .arg(
                    Arg::new("max")
                        .long("max")
                        .allow_negative_numbers(true)
                        .value_parser(value_parser!(f64))
                        .help("Upper limit"),
                ),
        )
        .subcommand(
            Command::new("demo")
                .about("Run a scripted sample lifecycle against the in-memory store")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the dossier as JSON"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    init_tracing(&config.log)?;

    match matches.subcommand() {
        Some(("evaluate", args)) => evaluate(args),
        Some(("demo", args)) => demo(config, args.get_flag("json")).await,
        _ => {
            cli().print_help()?;
            Ok(())
        }
    }
}

fn evaluate(args: &ArgMatches) -> Result<()> {
    let raw = args.get_one::<String>("value").context("--value is required")?;
    let min = args.get_one::<f64>("min").copied();
    let max = args.get_one::<f64>("max").copied();

    let value = MeasuredValue::parse(&sanitize_input(raw)?);
    let spec = Specification::global(ParameterId::new(), SampleTypeId::new()).with_range(min, max);
    let evaluation = evaluate_detailed(&value, Some(&spec));

    println!("Value:   {value}");
    println!("Limits:  {}", spec.limits_label());
    println!("Verdict: {:?}", evaluation.verdict);
    if let Some(deviation) = evaluation.deviation {
        println!("Reason:  {deviation:?}");
    }
    Ok(())
}

async fn demo(config: EngineConfig, json: bool) -> Result<()> {
    let catalog = Arc::new(InMemoryCatalog::new());
    let master = Arc::new(InMemoryMasterData::new());
    let credentials = Arc::new(InMemoryCredentials::new());

    let ph = catalog.insert_parameter(
        Parameter::new("PH", "pH", ParameterCategory::PhysicoChemical).with_unit("pH"),
    );
    let brix = catalog.insert_parameter(
        Parameter::new("BRIX", "Soluble solids", ParameterCategory::PhysicoChemical).with_unit("°Bx"),
    );
    let finished = master.add_sample_type("FP", "Finished product", TestCategory::PhysicoChemical);
    let product = master.add_product("OJ1L", "Orange juice 1 L");
    let batch = master.add_batch("L2026-0142", product);
    let ph_meter = master.add_equipment("PH-01", "Bench pH meter", true);
    let refractometer = master.add_equipment("RF-02", "Digital refractometer", true);

    catalog.insert_specification(
        Specification::for_product(ph, product, Some(finished))
            .with_range(Some(3.0), Some(4.2))
            .with_unit("pH"),
    );
    catalog.insert_specification(
        Specification::global(brix, finished)
            .with_range(Some(10.5), Some(12.5))
            .with_unit("°Bx"),
    );

    let org = OrganizationId::new();
    let plant = PlantId::new();
    let analyst = Actor::new("Bench analyst", org, plant, Role::LabAnalyst);
    let supervisor = Actor::new("QC supervisor", org, plant, Role::QcSupervisor);
    let manager = Actor::new("Quality manager", org, plant, Role::QualityManager);
    for actor in [&analyst, &supervisor, &manager] {
        credentials.set_password(actor.id, DEMO_PASSWORD);
    }

    let notifier = Arc::new(BroadcastNotifier::new(config.notification_capacity));
    let mut notifications = notifier.subscribe();
    let kernel = LabKernel::new(config, Arc::new(MemoryStore::new()), catalog, master, credentials)
        .with_notifier(notifier);

    let registration = kernel.register_sample(
        &analyst,
        RegisterSample::new(finished)
            .with_batch(batch)
            .collected(Utc::now(), analyst.id),
    )?;
    let sample_id = registration.sample.id;

    let readings = [("PH", "3,6", ph_meter), ("BRIX", "12.9", refractometer)];
    let mut session = kernel.open_session(&analyst, sample_id)?;
    while let Some(step) = session.current().cloned() {
        let (_, raw, instrument) = readings
            .iter()
            .find(|(code, ..)| *code == step.parameter.code)
            .with_context(|| format!("no reading for {}", step.parameter.code))?;
        session.set_value(step.analysis_id, raw)?;
        session.set_equipment(step.analysis_id, *instrument)?;
        if let AdvanceOutcome::JustificationRequired { .. } = session.advance()? {
            session.supply_oos_justification("Confirmed on duplicate reading; concentrate dosed high")?;
        }
    }
    session.finalize(kernel.gate(), &analyst, DEMO_PASSWORD).await?;

    kernel
        .approve(&supervisor, DEMO_PASSWORD, sample_id, Some("Brix excursion within customer tolerance"))
        .await?;
    kernel.release(&manager, DEMO_PASSWORD, sample_id, None).await?;

    let dossier = kernel.dossier(&manager, sample_id)?;
    let events = kernel.verify_audit_chain()?;
    let lot = kernel.lot_compliance(&manager, batch)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&dossier)?);
    } else {
        print_dossier(&dossier);
    }
    println!();
    println!("Audit chain: {events} events verified");
    while let Ok(n) = notifications.try_recv() {
        println!("Notified: {} -> {}", n.action, n.status);
    }
    println!(
        "Lot: {}",
        if lot.is_releasable() {
            "releasable".to_string()
        } else {
            format!("{} blocker(s)", lot.blockers.len())
        }
    );
    Ok(())
}

fn print_dossier(dossier: &SampleDossier) {
    println!("Sample {} [{}]", dossier.sample.code, dossier.sample.status);
    for a in &dossier.analyses {
        println!(
            "  {:<6} {:>8} {:<4} {:<13} limits {}",
            a.parameter_code,
            a.value.to_string(),
            a.unit.as_deref().unwrap_or(""),
            format!("{:?}", a.verdict),
            a.limits.as_deref().unwrap_or("-"),
        );
    }
    println!("Signatures:");
    for s in &dossier.signatures {
        println!(
            "  {} by {} at {}{}",
            s.action,
            s.actor_role,
            s.signed_at.format("%Y-%m-%d %H:%M:%S"),
            s.reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default()
        );
    }
    println!(
        "Certificate eligible: {}",
        if dossier.certificate_eligible { "yes" } else { "no" }
    );
}
