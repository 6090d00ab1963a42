use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn open_camera(&self, facing: &str) -> zbus::Result<()>;
    async fn close_camera(&self) -> zbus::Result<()>;
    async fn switch_camera(&self) -> zbus::Result<String>;
    async fn capture_face(&self) -> zbus::Result<bool>;
    async fn retake(&self) -> zbus::Result<()>;
    async fn confirm_enrollment(
        &self,
        name: &str,
        college_id: &str,
        roll_number: &str,
        class_name: &str,
    ) -> zbus::Result<String>;
    async fn start_scan(&self) -> zbus::Result<bool>;
    async fn stop_scan(&self) -> zbus::Result<()>;
    async fn scan_status(&self) -> zbus::Result<String>;
    async fn list_students(&self) -> zbus::Result<String>;
    async fn attendance_history(&self, student_id: &str) -> zbus::Result<String>;
    async fn today_feed(&self) -> zbus::Result<String>;
    async fn remove_student(&self, college_id: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new student by capturing their face
    Enroll {
        #[arg(long)]
        name: String,
        /// College ID (must be unique)
        #[arg(long)]
        college_id: String,
        #[arg(long)]
        roll_number: String,
        #[arg(long)]
        class_name: String,
        /// Camera to use: "front" or "back"
        #[arg(long, default_value = "front")]
        camera: String,
        /// How many capture attempts before giving up
        #[arg(long, default_value_t = 10)]
        attempts: u32,
    },
    /// Control the continuous attendance scanner
    Scan {
        #[command(subcommand)]
        action: ScanAction,
    },
    /// List enrolled students with attendance summaries
    List,
    /// Show attendance history for one student
    History {
        /// Student ID (from `rollcall list`)
        student_id: String,
    },
    /// Show attendance recorded today
    Today,
    /// Remove a student and all their data
    Remove {
        /// College ID of the student to remove
        college_id: String,
    },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum ScanAction {
    Start,
    Stop,
    Status,
}

async fn enroll(
    proxy: &RollcallProxy<'_>,
    name: String,
    college_id: String,
    roll_number: String,
    class_name: String,
    camera: String,
    attempts: u32,
) -> Result<()> {
    proxy
        .open_camera(&camera)
        .await
        .context("opening camera")?;
    println!("Camera live, looking for a face...");

    let mut captured = false;
    for attempt in 1..=attempts {
        if proxy.capture_face().await.context("capturing face")? {
            captured = true;
            break;
        }
        println!("No face detected (attempt {attempt}/{attempts}), retrying...");
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    if !captured {
        let _ = proxy.close_camera().await;
        bail!("no face detected after {attempts} attempts");
    }

    let result = proxy
        .confirm_enrollment(&name, &college_id, &roll_number, &class_name)
        .await;
    let _ = proxy.close_camera().await;

    let student = result.context("confirming enrollment")?;
    let student: serde_json::Value =
        serde_json::from_str(&student).context("parsing daemon reply")?;
    println!(
        "Enrolled {} (id {})",
        student["name"].as_str().unwrap_or(&name),
        student["id"].as_str().unwrap_or("?")
    );
    Ok(())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("parsing daemon reply")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = zbus::Connection::session()
        .await
        .context("connecting to session bus (is rollcalld running?)")?;
    let proxy = RollcallProxy::new(&conn).await?;

    match cli.command {
        Commands::Enroll {
            name,
            college_id,
            roll_number,
            class_name,
            camera,
            attempts,
        } => {
            enroll(
                &proxy, name, college_id, roll_number, class_name, camera, attempts,
            )
            .await?;
        }
        Commands::Scan { action } => match action {
            ScanAction::Start => {
                if proxy.start_scan().await? {
                    println!("Scanning started");
                } else {
                    println!("Scanner already running");
                }
            }
            ScanAction::Stop => {
                proxy.stop_scan().await?;
                println!("Scanning stopped");
            }
            ScanAction::Status => {
                println!("{}", proxy.scan_status().await?);
            }
        },
        Commands::List => print_json(&proxy.list_students().await?)?,
        Commands::History { student_id } => {
            print_json(&proxy.attendance_history(&student_id).await?)?
        }
        Commands::Today => print_json(&proxy.today_feed().await?)?,
        Commands::Remove { college_id } => {
            if proxy.remove_student(&college_id).await? {
                println!("Removed student {college_id}");
            } else {
                println!("No student with college id {college_id}");
            }
        }
        Commands::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}
