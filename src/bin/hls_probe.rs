use anyhow::{bail, Context, Result};
use std::env;
use tokio_util::sync::CancellationToken;

use hls_vault::core::config::AppConfig;
use hls_vault::core::manifest::{ManifestFetcher, MediaSource};
use hls_vault::utils::logging::init_tracing;
use hls_vault::utils::validation::{is_valid_video_url, redact_query, validate_url};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(Some("hls_vault=warn"));

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: hls-probe <manifest-url>");
        std::process::exit(1);
    }
    if !is_valid_video_url(&args[1]) {
        bail!("Only http(s) manifests can be probed");
    }
    let url = validate_url(&args[1])?;

    let config = AppConfig::load().unwrap_or_default();
    let fetcher = ManifestFetcher::new(
        config.download.http_client()?,
        config.download.retry_policy(),
    );

    let source = fetcher
        .resolve(url.as_str(), &CancellationToken::new())
        .await
        .with_context(|| format!("Failed to load {}", redact_query(url.as_str())))?;
    println!("Manifest: {}", redact_query(url.as_str()));
    print_source(&source);
    Ok(())
}

fn print_source(source: &MediaSource) {
    let kind = if source.variant.is_some() { "master" } else { "media" };
    println!("Kind: {}", kind);
    if let Some(variant) = &source.variant {
        println!(
            "Variant: {} bps, {}",
            variant.bandwidth,
            variant.resolution.as_deref().unwrap_or("unknown resolution")
        );
    }

    let video = &source.video;
    println!("Segments: {}", video.segments.len());
    println!("Duration: {:.1}s", source.total_duration());
    println!("Format: {:?}", video.segment_format());
    println!("Complete: {}", video.ended);
    let ranged = video.segments.iter().filter(|s| s.byte_range.is_some()).count();
    if ranged > 0 {
        println!("Byte-range segments: {}", ranged);
    }
    match &video.init_segment {
        Some(init) => println!("Init segment: {}", redact_query(&init.url)),
        None => println!("Init segment: none"),
    }
    match &source.audio {
        Some(audio) => println!("Separate audio: {} segments", audio.segments.len()),
        None => println!("Separate audio: none"),
    }
}
