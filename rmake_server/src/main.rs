use rmake_data::{JobId, JobStatus, ARCHIVE_DOWNLOAD_NAME};
use rmake_lib::{BuildService, Error, ServiceConfig};
use rocket::{
    data::{Limits, ToByteUnit},
    fairing::AdHoc,
    figment::{
        providers::{Env, Format, Serialized, Toml},
        Figment, Profile,
    },
    form::Form,
    http::{ContentType, Header, Status},
    response::{status, stream::TextStream},
    serde::json::Json,
    Build, Config, Rocket, State,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::upload::Upload;

#[macro_use]
extern crate rocket;

mod upload;

const DEFAULT_PORT: u16 = 3000;

#[derive(Responder)]
struct ArchiveDownload {
    body: Vec<u8>,
    content_type: ContentType,
    disposition: Header<'static>,
}

impl ArchiveDownload {
    fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            content_type: ContentType::new("application", "gzip"),
            disposition: Header::new(
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", ARCHIVE_DOWNLOAD_NAME),
            ),
        }
    }
}

/// stages the upload, then streams the build output as it is produced
#[post("/compile", data = "<upload>")]
async fn compile(
    service: &State<BuildService>,
    upload: Form<Upload<'_>>,
) -> Result<TextStream![String], status::Custom<String>> {
    let submission = upload
        .into_inner()
        .into_submission(&service.config().upload_dir)
        .await
        .map_err(rejection)?;
    let mut stream = service.submit(submission).await.map_err(rejection)?;
    info!(job = %stream.job_id(), "streaming build output");
    Ok(TextStream! {
        while let Some(line) = stream.next().await {
            yield line;
        }
    })
}

/// hands out a bundle once, every other request is a plain 404
#[get("/download/<job_id>")]
async fn download(service: &State<BuildService>, job_id: &str) -> Option<ArchiveDownload> {
    let id = JobId::parse(job_id).ok()?;
    match service.retrieve(&id).await {
        Ok(bytes) => {
            info!(job = %id, "sending bundle of {} bytes", bytes.len());
            Some(ArchiveDownload::new(bytes))
        }
        Err(err) => {
            info!(job = %id, "download refused: {}", err);
            None
        }
    }
}

#[get("/jobs/<job_id>/status")]
async fn job_status(service: &State<BuildService>, job_id: &str) -> Option<Json<JobStatus>> {
    let id = JobId::parse(job_id).ok()?;
    service.status(&id).await.map(Json)
}

#[catch(404)]
fn not_found() -> &'static str {
    "Error: File not found.\n"
}

fn rejection(err: Error) -> status::Custom<String> {
    let status = if err.is_client_error() {
        warn!("rejecting submission: {}", err);
        Status::BadRequest
    } else {
        error!("submission failed: {}", err);
        Status::InternalServerError
    };
    status::Custom(status, format!("Error: {}\n", err))
}

/// Rocket's configuration sources on top of our own defaults.
///
/// `Rocket.toml` and `ROCKET_*` variables configure the server as well as the
/// build service, see `ServiceConfig` for the service's keys.
fn figment() -> Figment {
    let limits = Limits::default()
        .limit("file", 256.mebibytes())
        .limit("data-form", 512.mebibytes());
    Figment::from(Serialized::defaults(Config::default()))
        .merge(("port", DEFAULT_PORT))
        .merge(("limits", limits))
        .merge(Serialized::defaults(ServiceConfig::default()))
        .merge(Toml::file(Env::var_or("ROCKET_CONFIG", "Rocket.toml")).nested())
        .merge(Env::prefixed("ROCKET_").ignore(&["PROFILE"]).global())
        .select(Profile::from_env_or("ROCKET_PROFILE", Config::DEFAULT_PROFILE))
}

fn build_rocket(figment: Figment) -> Rocket<Build> {
    rocket::custom(figment)
        .attach(AdHoc::try_on_ignite("Build service", |rocket| async move {
            let extracted = rocket.figment().extract::<ServiceConfig>();
            let config = match extracted {
                Ok(config) => config,
                Err(err) => {
                    error!("invalid build service configuration: {}", err);
                    return Err(rocket);
                }
            };
            let service = BuildService::new(config);
            if let Err(err) = service.prepare().await {
                error!("build service storage unavailable: {}", err);
                return Err(rocket);
            }
            info!("build service ready: {:?}", service.config());
            Ok(rocket.manage(service))
        }))
        .mount("/", routes![compile, download, job_status])
        .register("/", catchers![not_found])
}

#[launch]
fn rocket() -> _ {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    build_rocket(figment())
}
