use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Command-line client for the media gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    #[arg(short, long, default_value = "")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Video,
    Audio,
}

impl Kind {
    fn as_str(self) -> &'static str {
        match self {
            Kind::Video => "video",
            Kind::Audio => "audio",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the gateway answers
    Hello,
    /// Print the raw metadata for a video
    Info { video: String },
    /// List downloadable video and audio formats
    Formats { video: String },
    /// Stream a download to a file
    Download {
        video: String,
        #[arg(long, value_enum, default_value = "video")]
        kind: Kind,
        #[arg(long, default_value_t = 0)]
        quality: i64,
        #[arg(long)]
        format_note: Option<String>,
        #[arg(short, long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert("X-API-KEY", HeaderValue::from_str(&cli.key)?);

    match cli.command {
        Commands::Hello => {
            let res = client
                .get(format!("{}/api/hello", cli.url))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Info { video } => {
            let res = client
                .get(format!("{}/api/video/info", cli.url))
                .query(&[("url", video)])
                .headers(headers)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Formats { video } => {
            let res = client
                .get(format!("{}/api/video/info", cli.url))
                .query(&[("url", video)])
                .headers(headers)
                .send()
                .await?;
            if let Some(info) = json_or_report(res).await? {
                print_formats(&info);
            }
        }
        Commands::Download {
            video,
            kind,
            quality,
            format_note,
            out,
        } => {
            let res = client
                .post(format!("{}/api/video/download", cli.url))
                .headers(headers)
                .json(&json!({
                    "url": video,
                    "type": kind.as_str(),
                    "quality": quality,
                    "format_note": format_note.unwrap_or_default(),
                }))
                .send()
                .await?;

            let status = res.status();
            if !status.is_success() {
                eprintln!("Error: gateway returned status {}", status);
                if let Ok(text) = res.text().await {
                    eprintln!("Response: {}", text);
                }
                return Ok(());
            }

            let mut file = tokio::fs::File::create(&out).await?;
            let mut stream = res.bytes_stream();
            let mut written: u64 = 0;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            println!("Wrote {} bytes to {}", written, out.display());
        }
    }

    Ok(())
}

async fn json_or_report(res: reqwest::Response) -> Result<Option<Value>, Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: gateway returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(None);
    }
    Ok(Some(res.json().await?))
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(json) = json_or_report(res).await? {
        println!("{}", serde_json::to_string_pretty(&json)?);
    }
    Ok(())
}

fn field<'a>(format: &'a Value, key: &str) -> &'a str {
    format.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Formats carrying both a video and an audio codec.
fn video_formats(info: &Value) -> Vec<&Value> {
    formats(info)
        .filter(|f| field(f, "vcodec") != "none" && field(f, "acodec") != "none")
        .collect()
}

/// Audio-only formats, skipping mp4 containers.
fn audio_formats(info: &Value) -> Vec<&Value> {
    formats(info)
        .filter(|f| field(f, "vcodec") == "none" && field(f, "acodec") != "none")
        .filter(|f| {
            !field(f, "ext").eq_ignore_ascii_case("mp4")
                && !field(f, "audio_ext").eq_ignore_ascii_case("mp4")
        })
        .collect()
}

fn formats(info: &Value) -> impl Iterator<Item = &Value> {
    info.get("formats")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn label(format: &Value, numeric: &str, unit: &str) -> String {
    match format.get(numeric).and_then(Value::as_f64) {
        Some(n) => format!("{}{}", n.round() as i64, unit),
        None => match field(format, "format_note") {
            "" => "unknown".to_string(),
            note => note.to_string(),
        },
    }
}

fn print_formats(info: &Value) {
    println!("{}", field(info, "title"));

    println!("\nVideo:");
    for f in video_formats(info) {
        println!(
            "  {:<10} {:<6} {}",
            label(f, "height", "p"),
            field(f, "ext"),
            field(f, "format_note")
        );
    }

    println!("\nAudio:");
    for f in audio_formats(info) {
        println!(
            "  {:<10} {:<6} {}",
            label(f, "abr", "kbps"),
            field(f, "ext"),
            field(f, "format_note")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> Value {
        json!({
            "title": "Sample",
            "formats": [
                {"format_id": "18", "vcodec": "avc1", "acodec": "mp4a", "ext": "mp4", "height": 360},
                {"format_id": "137", "vcodec": "avc1", "acodec": "none", "ext": "mp4", "height": 1080},
                {"format_id": "140", "vcodec": "none", "acodec": "mp4a", "ext": "m4a", "audio_ext": "mp4", "abr": 129.5},
                {"format_id": "251", "vcodec": "none", "acodec": "opus", "ext": "webm", "abr": 160.0},
                {"format_id": "sb0", "vcodec": "none", "acodec": "none", "ext": "mhtml"}
            ]
        })
    }

    #[test]
    fn test_video_formats_need_both_codecs() {
        let info = info();
        let ids: Vec<&str> = video_formats(&info).iter().map(|f| field(f, "format_id")).collect();
        assert_eq!(ids, ["18"]);
    }

    #[test]
    fn test_audio_formats_skip_mp4() {
        let info = info();
        let ids: Vec<&str> = audio_formats(&info).iter().map(|f| field(f, "format_id")).collect();
        assert_eq!(ids, ["251"]);
    }

    #[test]
    fn test_labels() {
        let info = info();
        let audio = audio_formats(&info);
        assert_eq!(label(audio[0], "abr", "kbps"), "160kbps");
        assert_eq!(label(&json!({"format_note": "medium"}), "abr", "kbps"), "medium");
        assert_eq!(label(&json!({}), "height", "p"), "unknown");
    }

    #[test]
    fn test_missing_formats() {
        assert!(video_formats(&json!({"title": "x"})).is_empty());
    }
}
