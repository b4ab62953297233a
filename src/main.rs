use clap::{Parser, Subcommand};
use iiif_raster_cache::config;
use iiif_raster_cache::fallback::resolve_with_fallback;
use iiif_raster_cache::iiif::{self, BaseType, RasterOpts};
use iiif_raster_cache::imaging::RustBackend;
use iiif_raster_cache::lifecycle::{Lifecycle, VecQueue};
use iiif_raster_cache::output;
use iiif_raster_cache::pipeline::DerivativePipeline;
use iiif_raster_cache::resource::{FeaturedRegion, Resource, ResourceUpdate, SourceLocator};
use iiif_raster_cache::service::{Lookup, RasterResponse, RasterService};
use iiif_raster_cache::store::{JsonStore, ResourceStore};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "iiif-raster-cache")]
#[command(about = "IIIF raster cache and derivative pipeline")]
#[command(long_about = "\
IIIF raster cache and derivative pipeline

Serves IIIF Image API rasters from a content-addressed disk cache, and
pre-generates the common sizes and tile pyramids for each resource.

Cache layout:

  {raster_cache.directory}/
  └── 5f/2c/91/0a/5f2c910a.../         # sha256 of the identifier, sharded
      ├── standard/
      │   ├── base.png                  # full-resolution base render
      │   └── iiif/{region}/{size}/{rotation}/{quality}.{format}
      ├── limited/                      # bounded base for view-limited access
      └── featured/                     # featured-region crop

Resource lifecycle:
  pending → processing → ready | failure
  Changing a resource's source, featured region, or type purges its cache
  and sends it back to pending.

Logging goes to stderr; set RUST_LOG (default: info).

Run 'iiif-raster-cache gen-config' to generate a documented config.toml.")]
#[command(version)]
struct Cli {
    /// Path to config.toml
    #[arg(long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

/// The IIIF request path segments after the identifier.
#[derive(clap::Args, Clone)]
struct RequestArgs {
    identifier: String,
    /// standard, limited, or featured
    base_type: BaseType,
    region: String,
    size: String,
    rotation: String,
    /// e.g. color.jpg
    quality_format: String,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the config file
    CheckConfig,
    /// Print a stock config.toml with all options documented
    GenConfig,
    /// Create or update a resource
    Register {
        identifier: String,
        /// file:///abs/path, root://rel/path, or placeholder://name
        #[arg(long)]
        source: Option<SourceLocator>,
        /// x,y,w,h in source pixels
        #[arg(long)]
        featured_region: Option<FeaturedRegion>,
        /// Content type, e.g. Image, Audio, Text
        #[arg(long)]
        pcdm_type: Option<String>,
        #[arg(long)]
        view_limited: Option<bool>,
        /// Leave queued pipeline jobs for a later `process`
        #[arg(long)]
        no_process: bool,
    },
    /// Run the derivative pipeline
    Process {
        #[arg(required_unless_present = "pending")]
        identifier: Option<String>,
        /// Process every pending resource
        #[arg(long, conflicts_with = "identifier")]
        pending: bool,
    },
    /// Fetch one raster according to the miss policy
    Raster {
        #[command(flatten)]
        request: RequestArgs,
        /// Copy the raster here instead of printing its path
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show the normalized cache path of a request without generating
    Path {
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Print image information as JSON
    Info {
        identifier: String,
        #[arg(long, default_value = "standard")]
        base_type: BaseType,
    },
    /// Show one resource
    Show { identifier: String },
    /// Delete a resource and its cached rasters
    Delete { identifier: String },
    /// Count resources by status
    Stats,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    // Needs no config file
    if let Command::GenConfig = cli.command {
        print!("{}", config::stock_config_toml());
        return Ok(());
    }

    let config = config::load_config(&cli.config)?;
    init_thread_pool(&config.processing);

    let backend = RustBackend::new();
    let store = JsonStore::new(&config.store.directory);
    let service = RasterService::from_config(&config, &backend);

    match cli.command {
        Command::GenConfig => {}
        Command::CheckConfig => {
            output::print_config_summary(&config);
            println!("==> Config is valid");
        }
        Command::Register {
            identifier,
            source,
            featured_region,
            pcdm_type,
            view_limited,
            no_process,
        } => {
            let queue = VecQueue::new();
            let lifecycle = Lifecycle::new(
                &store,
                service.cache(),
                service.sources(),
                &backend,
                &queue,
            );
            let update = ResourceUpdate {
                source,
                featured_region,
                pcdm_type,
                has_view_limitation: view_limited,
            };
            output::print_upsert(&lifecycle.create_or_update(&identifier, update)?);
            if !no_process {
                let pipeline = DerivativePipeline::new(&service, &store);
                for id in queue.drain() {
                    output::print_pipeline_outcome(&id, &pipeline.run(&id));
                }
            }
        }
        Command::Process {
            identifier,
            pending,
        } => {
            let pipeline = DerivativePipeline::new(&service, &store);
            if pending {
                for (id, outcome) in pipeline.run_pending()? {
                    output::print_pipeline_outcome(&id, &outcome);
                }
            } else if let Some(id) = identifier {
                let outcome = pipeline.run(&id);
                output::print_pipeline_outcome(&id, &outcome);
                outcome?;
            }
        }
        Command::Raster {
            request,
            output: dest,
        } => {
            let opts = parse_request(&request)?;
            let resource = lookup(&service, &store, &request.identifier)?;
            let mut response = service.fetch(&resource, request.base_type, &opts)?;
            // One hop: a not-ready resource answers with its placeholder
            if let RasterResponse::Redirect(target) = &response {
                let placeholder = lookup(&service, &store, target)?;
                response = service.fetch(&placeholder, request.base_type, &opts)?;
            }
            match (&response, dest) {
                (RasterResponse::Cached(path), Some(dest)) => {
                    std::fs::copy(path, &dest)?;
                    println!("{}", dest.display());
                }
                (RasterResponse::Temporary(path), Some(dest)) => {
                    std::fs::copy(path, &dest)?;
                    println!("{}", dest.display());
                }
                _ => output::print_raster_response(&opts, &response),
            }
        }
        Command::Path { request } => {
            let opts = parse_request(&request)?;
            let resource = lookup(&service, &store, &request.identifier)?;
            let normalized = iiif::normalize(&resource, &opts)?;
            let key = resource.cache_key();
            let cache = service.cache();
            let resolution = resolve_with_fallback(&opts, &normalized, |o| {
                cache.raster_exists(request.base_type, &key, o)
            });
            let path = cache.raster_path(request.base_type, &key, &resolution.opts);
            output::print_cache_path(&normalized, &resolution, &path);
        }
        Command::Info {
            identifier,
            base_type,
        } => {
            let resource = lookup(&service, &store, &identifier)?;
            let info = service.image_info(&resource, base_type)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Show { identifier } => match store.get(&identifier)? {
            Some(resource) => output::print_resource(&resource),
            None => return Err(format!("Resource not found: {identifier}").into()),
        },
        Command::Delete { identifier } => {
            let queue = VecQueue::new();
            let lifecycle = Lifecycle::new(
                &store,
                service.cache(),
                service.sources(),
                &backend,
                &queue,
            );
            if lifecycle.delete(&identifier)? {
                println!("Deleted {identifier}");
            } else {
                println!("No resource {identifier}; purged any cached rasters");
            }
        }
        Command::Stats => {
            for line in output::format_status_counts(&store.list()?) {
                println!("{}", line);
            }
        }
    }

    Ok(())
}

/// Install the stderr subscriber. `RUST_LOG` overrides the `info` default.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Initialize the rayon thread pool based on processing config.
///
/// Capped at the number of available CPU cores: config can constrain down, not up.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}

/// Validate the request segments, reporting every bad field at once.
fn parse_request(request: &RequestArgs) -> Result<RasterOpts, Box<dyn std::error::Error>> {
    let (quality, format) = iiif::split_quality_format(&request.quality_format)?;
    iiif::parse_request(
        &request.region,
        &request.size,
        &request.rotation,
        quality,
        format,
    )
    .map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        format!("Invalid request: {}", messages.join("; ")).into()
    })
}

/// Resolve an identifier, following a redirect to the unavailable placeholder.
fn lookup(
    service: &RasterService<'_, RustBackend>,
    store: &dyn ResourceStore,
    identifier: &str,
) -> Result<Resource, Box<dyn std::error::Error>> {
    match service.resolve_resource(store, identifier)? {
        Lookup::Found(resource) | Lookup::Placeholder(resource) => Ok(resource),
        Lookup::Redirect(target) => match service.resolve_resource(store, &target)? {
            Lookup::Found(resource) | Lookup::Placeholder(resource) => Ok(resource),
            _ => Err(format!("Resource not found: {identifier}").into()),
        },
        Lookup::Missing => Err(format!("Resource not found: {identifier}").into()),
    }
}
