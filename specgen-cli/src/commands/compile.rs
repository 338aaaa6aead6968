use anyhow::Context;
use clap::Args;
use specgen::{CompileContext, ImageMetadata, SpecGenerator, compile};
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct CompileArgs {
    /// Creation request (.json, .yaml or .yml)
    #[arg(short, long)]
    pub request: PathBuf,

    /// Image metadata (.json, .yaml or .yml)
    #[arg(short, long, conflicts_with = "oci_image")]
    pub image: Option<PathBuf>,

    /// OCI image configuration JSON, as stored in an image layout
    #[arg(long)]
    pub oci_image: Option<PathBuf>,

    /// Write the result here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,
}

fn is_yaml(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"))
}

fn read(path: &Path, what: &str) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {} {}", what, path.display()))
}

fn load_request(path: &Path) -> anyhow::Result<SpecGenerator> {
    let text = read(path, "request")?;
    let request = if is_yaml(path) {
        SpecGenerator::from_yaml(&text)?
    } else {
        SpecGenerator::from_json(&text)?
    };
    Ok(request)
}

fn load_image(args: &CompileArgs, request: &SpecGenerator) -> anyhow::Result<ImageMetadata> {
    if let Some(path) = &args.oci_image {
        let config: oci_spec::image::ImageConfiguration = serde_json::from_str(&read(path, "image config")?)
            .with_context(|| format!("Invalid OCI image configuration {}", path.display()))?;
        return Ok(ImageMetadata::from_oci_config(&request.storage.image, &config)?);
    }
    let Some(path) = &args.image else {
        return Ok(ImageMetadata {
            name: request.storage.image.clone(),
            ..Default::default()
        });
    };
    let text = read(path, "image metadata")?;
    let image = if is_yaml(path) {
        serde_yaml::from_str(&text)
            .with_context(|| format!("Invalid image metadata {}", path.display()))?
    } else {
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid image metadata {}", path.display()))?
    };
    Ok(image)
}

pub fn execute(args: CompileArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let host = global.load_host()?;
    let engine = global.load_engine(host.get())?;
    let request = load_request(&args.request)?;
    let image = load_image(&args, &request)?;

    let ctx = CompileContext::new(&engine).with_host(host.get());
    let compiled = compile(&request, &image, &ctx)?;

    for warning in &compiled.warnings {
        eprintln!("Warning: {}", warning);
    }

    match &args.output {
        Some(path) => {
            let json = super::to_json(&compiled, args.pretty)?;
            std::fs::write(path, json + "\n")
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("{}", path.display());
        }
        None => super::print_json(&compiled, args.pretty)?,
    }
    Ok(())
}
