use std::{fs, io, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

mod operations;

/// Build a project on a remote rmake server
#[derive(StructOpt, Debug)]
#[structopt(name = "rmake")]
struct Opt {
    #[structopt(short = "s", long = "server", default_value = "http://localhost:3000")]
    server: String,

    /// PEM root certificate of a server using a private CA
    #[structopt(long = "ca-cert", parse(from_os_str))]
    ca_cert: Option<PathBuf>,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Debug, StructOpt)]
enum Operation {
    /// Upload a project, follow its build and fetch the results
    Build(BuildOperation),
    /// Fetch the results of a finished build
    Download(DownloadOperation),
    /// Show the state of a job
    Status(StatusOperation),
}

#[derive(Debug, StructOpt)]
struct BuildOperation {
    #[structopt(short = "o", long = "output", default_value = "compiled_output", parse(from_os_str))]
    output: PathBuf,
    /// arguments for make, quotes group words
    #[structopt(short = "m", long = "make-args", default_value = "")]
    make_args: String,
    #[structopt(name = "PROJECT_DIRECTORY", parse(from_os_str))]
    project_dir: PathBuf,
}

#[derive(Debug, StructOpt)]
struct DownloadOperation {
    #[structopt(short = "o", long = "output", default_value = "compiled_output", parse(from_os_str))]
    output: PathBuf,
    #[structopt(name = "JOB_ID")]
    job_id: String,
}

#[derive(Debug, StructOpt)]
struct StatusOperation {
    #[structopt(name = "JOB_ID")]
    job_id: String,
}

fn http_client(ca_cert: Option<&PathBuf>) -> Result<Client> {
    // builds may take arbitrarily long, the build stream must not time out
    let mut builder = Client::builder().timeout(None::<Duration>);
    if let Some(path) = ca_cert {
        let pem = fs::read(path)
            .with_context(|| format!("could not read CA certificate {}", path.display()))?;
        let cert = reqwest::Certificate::from_pem(&pem).context("could not read CA certificate as PEM")?;
        builder = builder.add_root_certificate(cert).use_rustls_tls();
    }
    builder.build().context("could not build http client")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();
    let opt = Opt::from_args();
    let client = http_client(opt.ca_cert.as_ref())?;
    let server = opt.server.trim_end_matches('/');

    match opt.operation {
        Operation::Build(op) => {
            let project = operations::collect_project(&op.project_dir)?;
            println!(
                "Uploading files from '{}' to {} with make arguments: '{}'...",
                op.project_dir.display(),
                server,
                op.make_args
            );
            let job_id = operations::submit(&client, server, &project, &op.make_args, &mut io::stdout())?;
            println!("\nCompilation finished. Job ID: {}", job_id);
            operations::download(&client, server, &job_id, &op.output)?;
        }
        Operation::Download(op) => {
            let job_id = op.job_id.parse().context("malformed job id")?;
            operations::download(&client, server, &job_id, &op.output)?;
        }
        Operation::Status(op) => {
            let job_id = op.job_id.parse().context("malformed job id")?;
            println!("{:?}", operations::status(&client, server, &job_id)?);
        }
    }
    Ok(())
}
