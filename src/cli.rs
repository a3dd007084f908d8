use crate::aggregator::AggregatedTable;
use crate::config::{Config, FailureMode, DEFAULT_CONFIG_FILE};
use crate::pipeline::{FeaturePipeline, PipelineOutcome, StageState};
use crate::trainer::{Trainer, TrainingOutcome};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "vpnlens")]
#[command(about = "Extraction de caractéristiques de flux et détection de trafic VPN")]
#[command(version)]
pub struct Cli {
    /// Fichier de configuration JSON
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Chargement, analyses, agrégation puis entraînement
    Run(RunArgs),

    /// Chargement, analyses et agrégation uniquement
    Extract(RunArgs),

    /// Entraîne les modèles à partir d'une table agrégée existante
    Train {
        /// Table CSV produite par `extract`
        #[arg(short, long)]
        input: PathBuf,

        /// Répertoire des artefacts
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Écrit la configuration par défaut
    InitConfig {
        /// Écrase un fichier existant
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Fichier CSV de flux
    #[arg(short, long)]
    pub input: PathBuf,

    /// Répertoire des artefacts (remplace output_dir)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Liste de réputation (remplace reputation.threat_list_path)
    #[arg(short, long)]
    pub threat_list: Option<PathBuf>,

    /// Toute étape défaillante interrompt l'exécution
    #[arg(long)]
    pub strict: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(list) = &self.threat_list {
            config.reputation.threat_list_path = Some(list.clone());
        }
        if self.strict {
            config.failure_mode = FailureMode::Hard;
        }
    }
}

pub async fn execute(cli: Cli, mut config: Config) -> Result<()> {
    match cli.command {
        Command::Run(args) => {
            args.apply(&mut config);
            let outcome = FeaturePipeline::new(config).run(&args.input).await?;
            print_outcome(&outcome);
            if let Some(training) = &outcome.training {
                print_training(training);
                check_training(training)?;
            }
            Ok(())
        }
        Command::Extract(args) => {
            args.apply(&mut config);
            let outcome = FeaturePipeline::new(config).extract(&args.input).await?;
            print_outcome(&outcome);
            Ok(())
        }
        Command::Train { input, output } => {
            if let Some(output) = output {
                config.output_dir = output;
            }
            let table = AggregatedTable::read_csv(&input)
                .with_context(|| format!("lecture de la table {}", input.display()))?;
            info!("{} lignes lues depuis {}", table.len(), input.display());

            let training = Trainer::new(config.trainer.clone()).train_all(Arc::new(table)).await;
            training.persist(&config.output_dir, &config.trainer)?;
            print_training(&training);
            check_training(&training)
        }
        Command::InitConfig { force } => {
            if cli.config.exists() && !force {
                bail!("{} existe déjà (utiliser --force pour l'écraser)", cli.config.display());
            }
            Config::default()
                .save(&cli.config)
                .map_err(|e| anyhow::anyhow!("écriture de {}: {}", cli.config.display(), e))?;
            println!("Configuration par défaut écrite dans {}", cli.config.display());
            Ok(())
        }
    }
}

fn print_outcome(outcome: &PipelineOutcome) {
    println!(
        "Flux: {} acceptés, {} rejetés",
        outcome.load_report.accepted, outcome.load_report.rejected
    );
    for stage in &outcome.stages {
        let marker = match stage.state {
            StageState::Completed => "ok",
            StageState::Degraded => "dégradé",
            StageState::Failed | StageState::TimedOut => "ÉCHEC",
        };
        match &stage.reason {
            Some(reason) => println!("  {:<12} {:<8} {} ms ({})", stage.stage, marker, stage.elapsed_ms, reason),
            None => println!("  {:<12} {:<8} {} ms", stage.stage, marker, stage.elapsed_ms),
        }
    }
    println!(
        "Table: {} lignes x {} colonnes -> {}",
        outcome.table.len(),
        outcome.table.columns.len(),
        outcome.table_path.display()
    );
}

fn print_training(training: &TrainingOutcome) {
    match &training.supervised {
        Ok(outcome) => {
            let m = &outcome.metrics;
            println!(
                "Forêt aléatoire: précision test {:.3} (entraînement {:.3}), {} / {} lignes",
                m.accuracy, m.train_accuracy, m.train_size, m.test_size
            );
            println!("  matrice de confusion {:?} {:?}", m.confusion_matrix.labels, m.confusion_matrix.matrix);
            for (label, class) in &m.per_class {
                println!(
                    "  {:<8} précision {:.3} rappel {:.3} F1 {:.3}",
                    label, class.precision, class.recall, class.f1
                );
            }
        }
        Err(e) => println!("Forêt aléatoire: {}", e),
    }
    match &training.unsupervised {
        Ok(outcome) => println!(
            "Isolation Forest: {} anomalie(s) sur {} flux (contamination {})",
            outcome.metrics.anomaly_count, outcome.metrics.total_flows, outcome.metrics.contamination
        ),
        Err(e) => println!("Isolation Forest: {}", e),
    }
}

fn check_training(training: &TrainingOutcome) -> Result<()> {
    if let Err(e) = &training.supervised {
        bail!("entraînement supervisé impossible: {}", e);
    }
    if let Err(e) = &training.unsupervised {
        bail!("entraînement non supervisé impossible: {}", e);
    }
    Ok(())
}
