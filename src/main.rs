use args::Args;
use getopts::Occur;
use glob::glob;
use malloc_tally::{stats::SNAPSHOT_PREFIX, Snapshot};

const PROGRAM_DESC: &str = "Print heap tallies stored by malloc_tally";
const PROGRAM_NAME: &str = "mt_print";

fn main() -> Result<(), anyhow::Error> {
    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.option(
        "d",
        "dir",
        "Directory that stores the tallies (MALLOC_TALLY_DIR)",
        "DIR",
        Occur::Req,
        None,
    );

    args.parse_from_cli()?;

    let dir: String = args.value_of("dir")?;
    let wildcard = format!("{}/{}.*.yaml", dir, SNAPSHOT_PREFIX);

    let mut found = 0;
    for path in glob(wildcard.as_str())? {
        let path = path?;
        let snapshot = Snapshot::load(&path)?;
        eprintln!("tally stored in {}", path.display());
        eprint!("{}", snapshot);
        found += 1;
    }

    if found == 0 {
        anyhow::bail!("no tallies found in {}", dir);
    }

    Ok(())
}
