use std::io;

use tracing_subscriber::EnvFilter;

use fish_vm::{Codebox, JitConfig, Vm};

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliConfig {
    source: Option<String>,
    code: Option<String>,
    no_jit: bool,
    jit_dump: bool,
    help: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            source: None,
            code: None,
            no_jit: false,
            jit_dump: false,
            help: false,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }

    let source = match (&cli.code, &cli.source) {
        (Some(code), _) => code.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)?,
        (None, None) => {
            print_usage();
            return Err(io::Error::other("no program given").into());
        }
    };

    let mut vm = Vm::new(Codebox::parse(&source));
    if cli.no_jit {
        vm.set_jit_config(JitConfig { enabled: false });
    }

    let result = vm.run();
    if cli.jit_dump {
        print!("{}", vm.dump_jit_info());
    }
    if let Err(error) = result {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| io::Error::other(err.to_string()))?;
    Ok(())
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cli = CliConfig::default();
    let mut index = 0usize;
    while index < args.len() {
        let arg = &args[index];
        match arg.as_str() {
            "--help" | "-h" => cli.help = true,
            "--no-jit" => cli.no_jit = true,
            "--jit-dump" => cli.jit_dump = true,
            "-e" => {
                index += 1;
                let code = args
                    .get(index)
                    .ok_or_else(|| "-e requires a program argument".to_string())?;
                cli.code = Some(code.clone());
            }
            other if other.starts_with('-') => {
                return Err(format!("unknown option '{other}'"));
            }
            other => {
                if cli.source.is_some() {
                    return Err("multiple source files given".to_string());
                }
                cli.source = Some(other.to_string());
            }
        }
        index += 1;
    }
    Ok(cli)
}

fn print_usage() {
    println!("usage: fish-vm [options] <program.fish>");
    println!();
    println!("options:");
    println!("  -e CODE      run CODE instead of reading a source file");
    println!("  --no-jit     interpret everything, never compile traces");
    println!("  --jit-dump   print compiled-trace details after the run");
    println!("  -h, --help   show this help");
}
