use std::path::PathBuf;

use gimli::constants as gim_con;
use structopt::StructOpt;

/// Looks a name up in the DWARF debug info of one or more object files.
#[derive(Debug, StructOpt)]
struct DieFind {
    /// Type or variable name to find.
    name: String,
    /// ELF object files to index.
    #[structopt(required = true)]
    files: Vec<PathBuf>,
}

const TAGS: [gimli::DwTag; 7] = [
    gim_con::DW_TAG_base_type,
    gim_con::DW_TAG_class_type,
    gim_con::DW_TAG_enumeration_type,
    gim_con::DW_TAG_structure_type,
    gim_con::DW_TAG_typedef,
    gim_con::DW_TAG_union_type,
    gim_con::DW_TAG_variable,
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = DieFind::from_args();

    let index = dieindex::DwarfIndex::new(&args.files)?;
    println!(
        "indexed {} names from {} files (address size {})",
        index.len(),
        index.file_count(),
        index.address_size()
    );

    let mut found = false;
    for tag in TAGS {
        if let Some(loc) = index.find(&args.name, tag) {
            found = true;
            println!(
                "{}: {} in {}, unit at {:#x}, DIE at +{:#x}",
                args.name,
                tag,
                args.files[loc.file].display(),
                loc.cu_offset,
                loc.die_offset
            );
        }
    }
    if !found {
        println!("{}: not found", args.name);
    }
    Ok(())
}
