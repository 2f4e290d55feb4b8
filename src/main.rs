//! Quiver CLI
//!
//! Encode, inspect and search zero-copy object records.
//!
//! # Usage
//!
//! ```bash
//! # Encode a JSON object request into a binary record
//! quiver encode --input object.json --output object.bin
//!
//! # Map a record (or a region of a larger file) and print it
//! quiver inspect --file object.bin --string 16 --string 24
//!
//! # Ingest a JSON array of requests and run a top-k query
//! quiver search --input objects.json --query 1,0,0 -k 5
//!
//! # Show which SIMD kernels were selected
//! quiver kernels
//! ```

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use quiver_db::buffer::{Buffer, MmapBuffer};
use quiver_db::ingest::{encode_request, Ingestor, ObjectRequest};
use quiver_db::object::ObjectReader;
use quiver_db::pool::{BufferPool, PoolConfig};
use quiver_db::simd;
use quiver_db::Metric;

#[derive(Parser)]
#[command(name = "quiver")]
#[command(about = "Zero-copy object records and vector search")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a JSON object request into the binary record format
    ///
    /// Input format: {"id": "<uuid>", "properties": {"k": "v"}, "vector": [0.1, ...]}
    Encode {
        /// Input JSON file
        #[arg(short, long)]
        input: PathBuf,

        /// Output record file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Memory-map a record and print its header, strings and vector
    Inspect {
        /// Record file
        #[arg(short, long)]
        file: PathBuf,

        /// Byte offset of the record within the file
        #[arg(long, default_value = "0")]
        offset: u64,

        /// Record length in bytes (defaults to the rest of the file)
        #[arg(long)]
        len: Option<usize>,

        /// Offset of a string to decode (repeatable)
        #[arg(long = "string")]
        strings: Vec<usize>,
    },

    /// Ingest a JSON array of object requests and run one query
    Search {
        /// Input JSON file (array of object requests)
        #[arg(short, long)]
        input: PathBuf,

        /// Query vector (comma separated floats)
        #[arg(short, long)]
        query: String,

        /// Number of results
        #[arg(short = 'k', long, default_value = "10")]
        k: usize,

        /// Similarity metric: dot_product or euclidean
        #[arg(long, default_value = "dot_product", value_parser = parse_metric)]
        metric: Metric,

        /// Pool size classes in bytes (comma separated, defaults to 1 KiB..16 MiB)
        #[arg(long, value_delimiter = ',')]
        buckets: Vec<usize>,
    },

    /// Print the distance kernels selected for this CPU
    Kernels,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Encode { input, output } => {
            let body = fs::read(&input).with_context(|| format!("reading {:?}", input))?;
            let request: ObjectRequest =
                serde_json::from_slice(&body).context("parsing object request")?;

            let encoded = encode_request(&request);
            fs::write(&output, encoded.writer.as_bytes())
                .with_context(|| format!("writing {:?}", output))?;

            tracing::info!(
                "Encoded object {} ({} bytes) to {:?}",
                request.id,
                encoded.writer.len(),
                output
            );
            for (key, offsets) in request.properties.keys().zip(&encoded.property_offsets) {
                println!("{key}: key at {}, value at {}", offsets.key, offsets.value);
            }
        }

        Commands::Inspect {
            file,
            offset,
            len,
            strings,
        } => {
            let buf = match len {
                Some(len) => MmapBuffer::open(&file, offset, len)?,
                None => {
                    let whole = MmapBuffer::open_whole(&file)?;
                    let start = usize::try_from(offset).context("offset too large")?;
                    anyhow::ensure!(
                        start <= whole.len(),
                        "offset {} is past the end of {:?} ({} bytes)",
                        start,
                        file,
                        whole.len()
                    );
                    whole.slice(start, whole.len())
                }
            };
            let reader = ObjectReader::new(buf)?;
            let header = reader.header();

            println!("Record: {:?} @ {}", file, offset);
            println!("  Length:         {} bytes", reader.buffer().len());
            println!("  Magic:          {:#010X}", header.magic);
            println!("  Version:        {}", header.version);
            println!("  Flags:          {:#06X}", header.flags);
            println!("  Properties:     {}", header.property_count);
            println!("  Vector offset:  {}", header.vector_offset);

            for at in strings {
                println!("  String @ {:<6} {:?}", at, reader.string_at(at)?);
            }

            // Regions at unaligned file offsets are decoded into a copy.
            match reader.vector_cow()? {
                Some(vector) => {
                    println!("  Dimension:      {}", vector.len());
                    println!("  Vector:         {:?}", vector);
                }
                None => println!("  Vector:         (none)"),
            }
        }

        Commands::Search {
            input,
            query,
            k,
            metric,
            buckets,
        } => {
            let query = parse_vector(&query).map_err(anyhow::Error::msg)?;
            anyhow::ensure!(!query.is_empty(), "query vector must not be empty");

            let body = fs::read(&input).with_context(|| format!("reading {:?}", input))?;
            let requests: Vec<ObjectRequest> =
                serde_json::from_slice(&body).context("parsing object requests")?;

            let config = if buckets.is_empty() {
                PoolConfig::default()
            } else {
                PoolConfig {
                    bucket_sizes: buckets,
                    ..PoolConfig::default()
                }
            };
            let ingestor =
                Ingestor::with_pool(query.len(), metric, BufferPool::with_config(config));
            for request in &requests {
                ingestor
                    .ingest(request)
                    .with_context(|| format!("ingesting {}", request.id))?;
            }

            let stats = ingestor.store().stats();
            tracing::info!(
                "Ingested {} objects ({} bytes, {} indexed)",
                stats.object_count,
                stats.total_bytes,
                ingestor.index().len()
            );

            let hits = ingestor.search(&query, k)?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }

        Commands::Kernels => {
            println!("Distance kernels: {}", simd::active_kernel());
        }
    }

    Ok(())
}

fn parse_vector(s: &str) -> Result<Vec<f32>, String> {
    s.split(',')
        .map(|v| v.trim().parse::<f32>().map_err(|e| e.to_string()))
        .collect()
}

fn parse_metric(s: &str) -> Result<Metric, String> {
    match s {
        "dot_product" | "dot" => Ok(Metric::DotProduct),
        "euclidean" | "l2" => Ok(Metric::Euclidean),
        other => Err(format!(
            "unknown metric {other:?} (expected dot_product or euclidean)"
        )),
    }
}
