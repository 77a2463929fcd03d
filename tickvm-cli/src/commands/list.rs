use serde::Serialize;

use crate::{
    app::GlobalOptions,
    output::{print_output, Align, TabWriter},
    programs,
};

#[derive(Debug, Serialize)]
pub struct ProgramInfo {
    pub name: String,
    pub description: String,
}

pub fn run(opts: &GlobalOptions) -> anyhow::Result<()> {
    let registry = programs::registry();
    let listing: Vec<ProgramInfo> = registry
        .iter()
        .map(|program| ProgramInfo {
            name: program.name.clone(),
            description: program.description.clone(),
        })
        .collect();

    print_output(&listing, opts, |listing| {
        let mut table = TabWriter::new(vec![("PROGRAM", Align::Left), ("DESCRIPTION", Align::Left)]);
        for info in listing {
            table.row(vec![info.name.clone(), info.description.clone()]);
        }
        table.print();
    })
}
