use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::{info, warn};
use simplelog::{Config, LevelFilter, WriteLogger};

use pdfgate::bridge::{PendingRead, ReadBlock};
use pdfgate::panic_handler;
use pdfgate::pdf::outline::flatten_outline;
use pdfgate::pdf::{
    DocumentInfo, LinkTarget, LoadedPage, OutlineNode, PageText, PdfLink, RenderOptions,
};
use pdfgate::rpc::{Attachment, Command, Dispatcher, RenderedImage};
use pdfgate::sandbox::{FileContext, HostFile, SandboxEngine};
use pdfgate::settings;

#[derive(Parser, Debug)]
#[command(name = "pdfgate", version, about = "Inspect PDF documents through a sandboxed PDFium")]
struct Cli {
    /// Settings file; defaults to the user config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// wasm build of PDFium, overriding the configured path
    #[arg(long, global = true)]
    wasm: Option<PathBuf>,

    #[arg(long, global = true)]
    password: Option<String>,

    /// Feed the engine through asynchronous host reads instead of a virtual file
    #[arg(long, global = true)]
    bridged: bool,

    #[arg(long, global = true, default_value = "pdfgate.log")]
    log_file: PathBuf,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Page count, page sizes and outline
    Info { file: PathBuf },
    /// Extracted text of one page (1-based) or all pages
    Text {
        file: PathBuf,
        #[arg(long)]
        page: Option<usize>,
        /// Report where this string occurs instead of printing the text
        #[arg(long)]
        find: Option<String>,
    },
    /// Links of one page (1-based) or all pages
    Links {
        file: PathBuf,
        #[arg(long)]
        page: Option<usize>,
    },
    /// Rasterize a page to PNG
    Render {
        file: PathBuf,
        #[arg(long, default_value_t = 1)]
        page: usize,
        /// Pixels per PDF point
        #[arg(long, default_value_t = 2.0)]
        scale: f64,
        #[arg(short, long)]
        output: PathBuf,
    },
}

impl Cmd {
    fn file(&self) -> &Path {
        match self {
            Self::Info { file }
            | Self::Text { file, .. }
            | Self::Links { file, .. }
            | Self::Render { file, .. } => file,
        }
    }
}

/// Serve each read on its own thread, as an asynchronous host source would.
fn threaded_reader(source: Arc<HostFile>) -> impl ReadBlock {
    move |request: PendingRead| {
        let source = Arc::clone(&source);
        std::thread::spawn(move || {
            let mut buf = vec![0u8; request.len()];
            match source.read(request.position(), &mut buf) {
                Ok(n) => {
                    request.complete(&buf[..n]);
                }
                Err(e) => {
                    warn!("host read at {} failed: {e}", request.position());
                    request.fail();
                }
            }
        });
    }
}

fn open(dispatcher: &Dispatcher, cli: &Cli) -> Result<DocumentInfo> {
    let path = cli.command.file();
    let password = cli.password.clone();
    let reply = if cli.bridged {
        let source = Arc::new(HostFile::open(path).with_context(|| format!("opening {path:?}"))?);
        let size = source.size();
        dispatcher.call::<DocumentInfo>(
            Command::LoadDocumentFromReader { size, password },
            vec![Attachment::Reader(Arc::new(threaded_reader(source)))],
        )
    } else {
        dispatcher.call::<DocumentInfo>(
            Command::LoadDocumentFromUrl {
                url: path.display().to_string(),
                password,
            },
            vec![],
        )
    };
    let info = reply.with_context(|| format!("loading {path:?}"))?.value;
    info!("{path:?}: {} pages", info.page_count);
    Ok(info)
}

fn page_indices(info: &DocumentInfo, page: Option<usize>) -> Result<Vec<usize>> {
    match page {
        None => Ok((0..info.page_count).collect()),
        Some(n) if (1..=info.page_count).contains(&n) => Ok(vec![n - 1]),
        Some(n) => bail!("page {n} out of range 1..={}", info.page_count),
    }
}

fn with_page<T>(
    dispatcher: &Dispatcher,
    info: &DocumentInfo,
    index: usize,
    f: impl FnOnce(&LoadedPage) -> Result<T>,
) -> Result<T> {
    let page = dispatcher
        .call::<LoadedPage>(
            Command::LoadPage {
                document: info.handle,
                index,
            },
            vec![],
        )?
        .value;
    let result = f(&page);
    dispatcher.call::<()>(Command::ClosePage { page: page.handle }, vec![])?;
    result
}

fn print_info(dispatcher: &Dispatcher, info: &DocumentInfo) -> Result<()> {
    println!("pages: {}", info.page_count);
    println!("permissions: {:#010x}", info.permissions);
    if info.security_handler_revision >= 0 {
        println!("security handler revision: {}", info.security_handler_revision);
    }
    for page in &info.pages {
        println!(
            "  page {:>4}: {:.1} x {:.1} pt, rotation {}",
            page.index + 1,
            page.width,
            page.height,
            page.rotation
        );
    }

    let outline = dispatcher
        .call::<Vec<OutlineNode>>(Command::LoadOutline { document: info.handle }, vec![])?
        .value;
    if !outline.is_empty() {
        println!("outline:");
        for entry in flatten_outline(&outline) {
            let target = entry
                .node
                .dest
                .as_ref()
                .map(|d| format!(" -> p.{}", d.page_number))
                .unwrap_or_default();
            println!("  {}{}{target}", "  ".repeat(entry.level), entry.node.title);
        }
    }
    Ok(())
}

fn print_text(
    dispatcher: &Dispatcher,
    info: &DocumentInfo,
    page: Option<usize>,
    find: Option<&str>,
) -> Result<()> {
    for index in page_indices(info, page)? {
        let text = with_page(dispatcher, info, index, |page| {
            Ok(dispatcher
                .call::<PageText>(Command::LoadText { page: page.handle }, vec![])?
                .value)
        })?;
        match find {
            Some(needle) => {
                for range in text.find_ignore_case(needle) {
                    for rect in text.highlight_rects(range.clone()) {
                        println!(
                            "p.{} chars {}..{} at ({:.1}, {:.1}, {:.1}, {:.1})",
                            index + 1,
                            range.start,
                            range.end,
                            rect.left,
                            rect.top,
                            rect.right,
                            rect.bottom
                        );
                    }
                }
            }
            None => {
                println!("--- page {} ---", index + 1);
                println!("{}", text.full_text);
            }
        }
    }
    Ok(())
}

fn print_links(dispatcher: &Dispatcher, info: &DocumentInfo, page: Option<usize>) -> Result<()> {
    for index in page_indices(info, page)? {
        let links = with_page(dispatcher, info, index, |page| {
            Ok(dispatcher
                .call::<Vec<PdfLink>>(Command::LoadLinks { page: page.handle }, vec![])?
                .value)
        })?;
        for link in links {
            let target = match &link.target {
                LinkTarget::Url(url) => url.clone(),
                LinkTarget::Dest(dest) => format!("page {} ({:?})", dest.page_number, dest.command),
            };
            println!("p.{} [{} rects] {target}", index + 1, link.rects.len());
        }
    }
    Ok(())
}

fn render(
    dispatcher: &Dispatcher,
    info: &DocumentInfo,
    page: usize,
    scale: f64,
    output: &Path,
) -> Result<()> {
    let index = page_indices(info, Some(page))?[0];
    let options = RenderOptions::scaled(&info.pages[index], scale);

    let reply = with_page(dispatcher, info, index, |page| {
        Ok(dispatcher.call::<RenderedImage>(
            Command::RenderPage {
                page: page.handle,
                options: options.clone(),
            },
            vec![],
        )?)
    })?;
    let Some(pixels) = reply.transfer.into_iter().next() else {
        bail!("render reply carried no pixel buffer");
    };

    let file = File::create(output).with_context(|| format!("creating {output:?}"))?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), reply.value.width, reply.value.height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_compression(png::Compression::Fast);
    encoder.write_header()?.write_image_data(&pixels)?;
    println!("wrote {}x{} {output:?}", reply.value.width, reply.value.height);
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = settings::get_sandbox_config();
    let wasm = cli.wasm.clone().unwrap_or_else(settings::get_wasm_path);
    if cli.bridged && config.read_timeout.is_none() {
        config.read_timeout = Some(std::time::Duration::from_secs(60));
    }
    let dispatcher = Dispatcher::spawn(
        move || SandboxEngine::load(&wasm, config),
        settings::get_layout_policy(),
    )?;

    let info = open(&dispatcher, cli)?;
    let result = match &cli.command {
        Cmd::Info { .. } => print_info(&dispatcher, &info),
        Cmd::Text { page, find, .. } => print_text(&dispatcher, &info, *page, find.as_deref()),
        Cmd::Links { page, .. } => print_links(&dispatcher, &info, *page),
        Cmd::Render {
            page,
            scale,
            output,
            ..
        } => render(&dispatcher, &info, *page, *scale, output),
    };
    dispatcher.call::<()>(Command::CloseDocument { document: info.handle }, vec![])?;
    dispatcher.shutdown();
    result
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    panic_handler::initialize_panic_handler();

    match &cli.config {
        Some(path) => {
            if !settings::load_settings_from_path(path) {
                bail!("cannot load settings from {path:?}");
            }
        }
        None => settings::load_settings(),
    }

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        settings::get_log_level()
    };
    WriteLogger::init(level, Config::default(), File::create(&cli.log_file)?)?;
    info!("Starting pdfgate");

    let result = run(&cli);
    if let Err(e) = &result {
        log::error!("{e:?}");
    }
    info!("Shutting down pdfgate");
    result
}
