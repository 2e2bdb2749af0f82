use anyhow::Result;
use console::style;

use massip_core::{ParserSet, Settings};

use super::print_rejections;

pub fn run(settings: &Settings) -> Result<()> {
    let parsers = ParserSet::discover(&settings.parser_dir);

    if parsers.is_empty() {
        eprintln!(
            "{}",
            style(format!("No parsers in {}", settings.parser_dir.display())).dim()
        );
    }

    for parser in parsers.iter() {
        println!(
            "{} {}  {}",
            style(parser.name()).bold(),
            style(format!("[{}]", parser.entity_type())).cyan(),
            parser.description().unwrap_or_default()
        );
        let pattern = parser.pattern().as_str().split_whitespace().collect::<Vec<_>>();
        println!("    {}", style(pattern.join(" ")).dim());
    }

    print_rejections("parser definitions", parsers.rejected());
    Ok(())
}
