use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::handler::Handler;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::{AppConfig, ConnectionSettings, DropdownOptions, OptionList, RedactedSettings, SettingsStore};
use crate::dashboard::{self, Dashboard, DashboardStatus};
use crate::err::{handler404, Error};
use crate::models::{Exam, ExamChoice, ExamDraft, GradeDraft, GradeEntry, IdPreview, Student, StudentChoice, StudentDraft};
use crate::records::{self, StudentOrder, WriteReport};
use crate::schema::{self, SchemaStatus};
use crate::worker::{self, WorkerPool};
use crate::{breaks, proceeds, Payload};

/// Everything a request handler may touch.
pub struct AppContext {
    pub config: AppConfig,
    pub store: SettingsStore,
    pub pool: WorkerPool,
    pub dashboard: Mutex<Option<Dashboard>>,
}

impl AppContext {
    pub fn new(config: AppConfig, settings: ConnectionSettings) -> Self {
        let store = SettingsStore::new(&config.config_dir);
        let pool = WorkerPool::new(settings, config.max_workers);
        Self {
            config,
            store,
            pool,
            dashboard: Mutex::new(None),
        }
    }
}

type Ctx = Extension<Arc<AppContext>>;

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/settings/connection", get(read_connection).put(save_connection))
        .route("/settings/connection/test", post(test_connection))
        .route("/settings/connection/defaults", post(restore_defaults))
        .route("/settings/rscript", put(save_rscript_path))
        .route("/options", get(read_options))
        .route("/options/semesters", post(add_semester))
        .route("/options/study-programs", post(add_study_program))
        .route("/students", get(list_students).post(create_student))
        .route(
            "/students/:matriculation_number",
            get(find_student).delete(delete_student),
        )
        .route("/exams", get(list_exams).post(create_exam))
        .route("/exams/:pnr", get(find_exam).delete(delete_exam))
        .route("/grades", get(list_grades).post(create_grade))
        .route("/grades/:matriculation_number/:pnr", axum::routing::delete(delete_grade))
        .route("/preview/matriculation-number", get(preview_matriculation_number))
        .route("/preview/pnr", get(preview_pnr))
        .route("/dashboard/start", post(start_dashboard))
        .route("/dashboard/stop", post(stop_dashboard))
        .layer(Extension(ctx))
        .fallback(handler404.into_service())
}

/// Logs the failure and wraps the result in the response envelope. User
/// mistakes go to `warn`, everything else to `error`.
fn report<V: Serialize>(action: &str, result: Result<V, Error>) -> Payload<V> {
    match result {
        Ok(value) => proceeds(value),
        Err(err) => {
            if err.is_expected() {
                log::warn!("{} rejected: {}", action, err);
            } else {
                log::error!("{} failed: {}", action, err);
            }
            breaks(err)
        }
    }
}

fn today() -> NaiveDate {
    Local::now().naive_local().date()
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Payload<Health> {
    proceeds(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn read_connection(Extension(ctx): Ctx) -> Payload<RedactedSettings> {
    report(
        "Reading connection settings",
        ctx.store.load_connection().await.map(|settings| settings.redacted()),
    )
}

#[derive(Debug, Serialize)]
struct SavedConnection {
    settings: RedactedSettings,
    schema: SchemaStatus,
}

async fn save_connection(Extension(ctx): Ctx, Json(incoming): Json<ConnectionSettings>) -> Payload<SavedConnection> {
    report("Saving connection settings", apply_connection(&ctx, incoming).await)
}

/// Stores the settings, points the pool at them and provisions the database.
async fn apply_connection(ctx: &AppContext, incoming: ConnectionSettings) -> Result<SavedConnection, Error> {
    let incoming = ctx.store.merge_connection(incoming).await?;
    ctx.pool.reconfigure(incoming.clone()).await;
    log::info!(
        "Connection settings saved for {}@{}:{}/{}",
        incoming.username,
        incoming.host,
        incoming.port,
        incoming.database
    );
    let schema = schema::prepare_database(&incoming).await?;
    Ok(SavedConnection {
        settings: incoming.redacted(),
        schema,
    })
}

#[derive(Serialize)]
struct Message {
    message: String,
}

async fn test_connection(Json(settings): Json<ConnectionSettings>) -> Payload<Message> {
    let result = match settings.validate() {
        Ok(()) => worker::test_connection(&settings)
            .await
            .map(|()| Message {
                message: "Connection successful!".to_string(),
            })
            .map_err(Error::from),
        Err(err) => Err(err),
    };
    report("Testing connection", result)
}

async fn restore_defaults(Extension(ctx): Ctx) -> Payload<RedactedSettings> {
    let result = async {
        let mut settings = ctx.store.load_connection().await?;
        settings.restore_defaults();
        ctx.store.save_connection(&settings).await?;
        ctx.pool.reconfigure(settings.clone()).await;
        Ok::<_, Error>(settings.redacted())
    };
    report("Restoring default connection settings", result.await)
}

#[derive(Deserialize)]
struct RscriptPath {
    #[serde(default)]
    rscript_path: String,
}

async fn save_rscript_path(Extension(ctx): Ctx, Json(body): Json<RscriptPath>) -> Payload<RedactedSettings> {
    report(
        "Saving Rscript path",
        ctx.store
            .set_rscript_path(&body.rscript_path)
            .await
            .map(|settings| settings.redacted()),
    )
}

async fn read_options(Extension(ctx): Ctx) -> Payload<DropdownOptions> {
    report("Reading dropdown options", ctx.store.load_options().await)
}

#[derive(Deserialize)]
struct NewOption {
    #[serde(default)]
    value: String,
}

async fn add_semester(Extension(ctx): Ctx, Json(body): Json<NewOption>) -> Payload<DropdownOptions> {
    report(
        "Adding semester",
        ctx.store.append_option(OptionList::Semesters, &body.value).await,
    )
}

async fn add_study_program(Extension(ctx): Ctx, Json(body): Json<NewOption>) -> Payload<DropdownOptions> {
    report(
        "Adding study program",
        ctx.store.append_option(OptionList::StudyPrograms, &body.value).await,
    )
}

#[derive(Deserialize)]
struct StudentListQuery {
    #[serde(default)]
    order: StudentOrder,
}

#[derive(Serialize)]
struct StudentList {
    students: Vec<Student>,
    choices: Vec<StudentChoice>,
}

async fn list_students(Extension(ctx): Ctx, Query(query): Query<StudentListQuery>) -> Payload<StudentList> {
    let result = records::list_students(&ctx.pool, query.order)
        .await
        .map(|students| StudentList {
            choices: students.iter().map(StudentChoice::from).collect(),
            students,
        });
    report("Listing students", result)
}

async fn find_student(Extension(ctx): Ctx, Path(matriculation_number): Path<String>) -> Payload<Student> {
    report(
        "Looking up student",
        records::find_student(&ctx.pool, &matriculation_number).await,
    )
}

async fn create_student(Extension(ctx): Ctx, Json(draft): Json<StudentDraft>) -> Payload<WriteReport> {
    report(
        "Creating student",
        records::create_student(&ctx.pool, draft, today()).await,
    )
}

async fn delete_student(Extension(ctx): Ctx, Path(matriculation_number): Path<String>) -> Payload<WriteReport> {
    report(
        "Deleting student",
        records::delete_student(&ctx.pool, &matriculation_number).await,
    )
}

#[derive(Serialize)]
struct ExamList {
    exams: Vec<Exam>,
    choices: Vec<ExamChoice>,
}

async fn list_exams(Extension(ctx): Ctx) -> Payload<ExamList> {
    let result = records::list_exams(&ctx.pool).await.map(|exams| ExamList {
        choices: exams.iter().map(ExamChoice::from).collect(),
        exams,
    });
    report("Listing exams", result)
}

async fn find_exam(Extension(ctx): Ctx, Path(pnr): Path<String>) -> Payload<Exam> {
    report("Looking up exam", records::find_exam(&ctx.pool, &pnr).await)
}

async fn create_exam(Extension(ctx): Ctx, Json(draft): Json<ExamDraft>) -> Payload<WriteReport> {
    report("Creating exam", records::create_exam(&ctx.pool, draft).await)
}

async fn delete_exam(Extension(ctx): Ctx, Path(pnr): Path<String>) -> Payload<WriteReport> {
    report("Deleting exam", records::delete_exam(&ctx.pool, &pnr).await)
}

#[derive(Serialize)]
struct GradeList {
    grades: Vec<GradeEntry>,
}

async fn list_grades(Extension(ctx): Ctx) -> Payload<GradeList> {
    report(
        "Listing grades",
        records::list_grades(&ctx.pool)
            .await
            .map(|grades| GradeList { grades }),
    )
}

async fn create_grade(Extension(ctx): Ctx, Json(draft): Json<GradeDraft>) -> Payload<WriteReport> {
    report("Creating grade", records::create_grade(&ctx.pool, draft).await)
}

async fn delete_grade(
    Extension(ctx): Ctx,
    Path((matriculation_number, pnr)): Path<(String, String)>,
) -> Payload<WriteReport> {
    report(
        "Deleting grade",
        records::delete_grade(&ctx.pool, &matriculation_number, &pnr).await,
    )
}

async fn preview_matriculation_number(Extension(ctx): Ctx) -> Payload<IdPreview> {
    report(
        "Previewing matriculation number",
        records::last_matriculation_number(&ctx.pool).await,
    )
}

async fn preview_pnr(Extension(ctx): Ctx) -> Payload<IdPreview> {
    report("Previewing exam number", records::last_pnr(&ctx.pool).await)
}

async fn start_dashboard(Extension(ctx): Ctx) -> Payload<DashboardStatus> {
    // The slot is only held while inspecting or spawning, never while
    // waiting for the port, so a stop request is not held up.
    let port = {
        let mut slot = ctx.dashboard.lock().await;
        if let Some(running) = slot.as_mut() {
            if !running.has_exited() {
                let port = running.port();
                drop(slot);
                return proceeds(dashboard::running_status(port).await);
            }
            log::warn!("Dashboard process had exited, starting a new one");
            *slot = None;
        }

        let spawned = match ctx.store.load_connection().await {
            Ok(settings) => Dashboard::spawn(
                &settings.rscript_path.unwrap_or_default(),
                &ctx.config.dashboard_dir,
                ctx.config.dashboard_port,
            ),
            Err(err) => Err(err),
        };
        match spawned {
            Ok(started) => {
                let port = started.port();
                *slot = Some(started);
                port
            }
            Err(err) => return report("Starting dashboard", Err(err)),
        }
    };
    proceeds(dashboard::startup_status(port, ctx.config.dashboard_timeout).await)
}

async fn stop_dashboard(Extension(ctx): Ctx) -> Payload<Message> {
    let taken = ctx.dashboard.lock().await.take();
    let message = match taken {
        Some(running) => {
            running.stop().await;
            "Shiny Dashboard stopped"
        }
        None => "Shiny Dashboard is not running",
    };
    proceeds(Message {
        message: message.to_string(),
    })
}
