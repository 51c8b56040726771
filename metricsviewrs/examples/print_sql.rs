use std::{env, fs, path::PathBuf};

use metricsview::{
    DialectKind, MetricsConfig, MetricsViewRegistry, MetricsViewResolver, Query,
    SecurityAttributes, SqlBuilder,
};

fn usage() {
    eprintln!("Usage: print_sql <project_dir> <query_json> [duckdb|druid|clickhouse|pinot]");
    eprintln!("Example: cargo run --example print_sql -- demo queries/by_publisher.json druid");
}

fn main() -> anyhow::Result<()> {
    metricsview::init_tracing();
    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    let project_dir = PathBuf::from(args.remove(0));
    let query_path = PathBuf::from(args.remove(0));
    let dialect: DialectKind = match args.first() {
        Some(name) => serde_json::from_value(serde_json::Value::String(name.clone()))?,
        None => DialectKind::DuckDb,
    };

    let registry = MetricsViewRegistry::load_from_dir(project_dir)?;
    let query: Query = serde_json::from_str(&fs::read_to_string(query_path)?)?;
    let resolved = registry.resolve(&query.metrics_view, &SecurityAttributes::new())?;

    let config = MetricsConfig::load_default().for_datasource(&resolved.view.data_source);
    let builder = SqlBuilder::new(config.build_options());
    let plan = builder.build(
        &resolved.view,
        dialect.dialect(),
        &resolved.security,
        &query,
        None,
    )?;
    println!("{}", plan.query.sql);
    for (idx, arg) in plan.query.args.iter().enumerate() {
        println!("-- ${}: {arg:?}", idx + 1);
    }
    if let Some(spec) = plan.pivot {
        println!("{}", spec.pivot_sql(dialect.dialect(), "<pivot_source>"));
    }
    Ok(())
}
