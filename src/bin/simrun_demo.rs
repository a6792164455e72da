//! A toy travel demand model run through `simrun`.
//!
//! ```text
//! simrun-demo --output-dir out --pipeline-dir out/pipeline
//! simrun-demo --multiprocess 4 --chunk-training-mode adaptive
//! simrun-demo --resume-after tour_frequency
//! ```

use std::process::ExitCode;

use simrun::errors::report;
use simrun::errors::BoxError;
use simrun::errors::ConfigurationError;
use simrun::ChunkTarget;
use simrun::Column;
use simrun::StepContext;
use simrun::StepRegistry;
use simrun::StepSpec;
use simrun::Table;

const HOUSEHOLDS: i64 = 2000;
const ZONES: i64 = 25;

fn initialize_households(ctx: &mut StepContext) -> Result<(), BoxError> {
    let zones: Vec<i64> = (1..=ZONES).collect();
    let area = zones.iter().map(|z| 0.5 + (z % 7) as f64 * 1.25).collect();
    let land_use = Table::new(Some("zone_id"), zones)?.with_column("area", Column::Float(area))?;

    let ids: Vec<i64> = (1..=HOUSEHOLDS).collect();
    let income = ids.iter().map(|id| 15_000 + (id * 7919) % 150_000).collect();
    let home_zone = ids.iter().map(|id| 1 + (id * 31) % ZONES).collect();
    let households = Table::new(Some("household_id"), ids)?
        .with_column("income", Column::Int(income))?
        .with_column("home_zone_id", Column::Int(home_zone))?;

    ctx.write("land_use", land_use)?;
    ctx.write("households", households)?;
    Ok(())
}

fn initialize_persons(ctx: &mut StepContext) -> Result<(), BoxError> {
    let households = ctx.read("households")?;
    let mut ids = Vec::new();
    let mut household_ids = Vec::new();
    let mut ages = Vec::new();
    for &hh in households.index() {
        for k in 0..(hh % 4 + 1) {
            let id = hh * 10 + k;
            ids.push(id);
            household_ids.push(hh);
            ages.push(3 + (id * 37) % 85);
        }
    }
    let persons = Table::new(Some("person_id"), ids)?
        .with_column("household_id", Column::Int(household_ids))?
        .with_column("age", Column::Int(ages))?;
    ctx.write("persons", persons)?;
    Ok(())
}

fn tour_frequency(ctx: &mut StepContext) -> Result<(), BoxError> {
    let persons = ctx.read("persons")?;
    let ages = persons.int_column("age")?;
    let households = persons.int_column("household_id")?;

    let mut ids = Vec::new();
    let mut person_ids = Vec::new();
    let mut household_ids = Vec::new();
    let mut purposes = Vec::new();
    for (pos, &person) in persons.index().iter().enumerate() {
        let age = ages[pos];
        let purpose = match age {
            5..=17 => "school",
            18..=64 => "work",
            _ => "shopping",
        };
        let count = if (18..=64).contains(&age) { 2 } else { 1 };
        for k in 0..count {
            ids.push(person * 10 + k);
            person_ids.push(person);
            household_ids.push(households[pos]);
            purposes.push(if k == 0 { purpose } else { "shopping" }.to_string());
        }
    }
    let tours = Table::new(Some("tour_id"), ids)?
        .with_column("person_id", Column::Int(person_ids))?
        .with_column("household_id", Column::Int(household_ids))?
        .with_column("purpose", Column::Text(purposes))?;
    ctx.log_bytes(persons.approx_bytes() + tours.approx_bytes());
    if let Some(&traced) = ctx.trace_ids("persons").first() {
        tracing::debug!("traced person {traced} is in this chunk: {}", persons.index().contains(&traced));
    }
    ctx.write("tours", tours)?;
    Ok(())
}

fn mode_choice(ctx: &mut StepContext) -> Result<(), BoxError> {
    let tours = ctx.read("tours")?;
    let households = ctx.read("households")?;
    let land_use = ctx.read("land_use")?;

    let income = households.int_column("income")?;
    let home = households.int_column("home_zone_id")?;
    let area = match land_use.column("area") {
        Some(Column::Float(area)) => area,
        _ => return Err("land_use has no float column 'area'".into()),
    };
    let household_pos = |id: i64| households.index().iter().position(|h| *h == id);
    let zone_pos = |id: i64| land_use.index().iter().position(|z| *z == id);

    let mut modes = Vec::with_capacity(tours.len());
    let mut distances = Vec::with_capacity(tours.len());
    for (pos, hh) in tours.int_column("household_id")?.iter().enumerate() {
        let h = household_pos(*hh).ok_or_else(|| format!("tour {} has unknown household {hh}", tours.index()[pos]))?;
        let zone = zone_pos(home[h]).ok_or_else(|| format!("household {hh} lives in unknown zone"))?;
        let distance = area[zone] * (1.0 + (tours.index()[pos] % 5) as f64);
        let mode = if distance < 2.0 {
            "walk"
        } else if income[h] > 60_000 {
            "car"
        } else {
            "transit"
        };
        if ctx.is_traced_in("tours", tours.index()[pos]) {
            tracing::info!("traced tour {} goes by {mode}", tours.index()[pos]);
        }
        modes.push(mode.to_string());
        distances.push(distance);
    }

    let mut chosen = tours.clone();
    chosen.set_column("mode", Column::Text(modes))?;
    chosen.set_column("distance", Column::Float(distances))?;
    ctx.log_bytes(chosen.approx_bytes());
    ctx.write("tours", chosen)?;
    Ok(())
}

fn write_summary(ctx: &mut StepContext) -> Result<(), BoxError> {
    let households = ctx.read("households")?.len() as i64;
    let persons = ctx.read("persons")?.len() as i64;
    let tours = ctx.read("tours")?;
    let car = match tours.column("mode") {
        Some(Column::Text(modes)) => modes.iter().filter(|m| *m == "car").count() as i64,
        _ => 0,
    };
    let summary = Table::new(None, vec![0])?
        .with_column("households", Column::Int(vec![households]))?
        .with_column("persons", Column::Int(vec![persons]))?
        .with_column("tours", Column::Int(vec![tours.len() as i64]))?
        .with_column("car_tours", Column::Int(vec![car]))?;
    ctx.write("summary", summary)?;
    Ok(())
}

fn build_registry() -> Result<StepRegistry, ConfigurationError> {
    let mut registry = StepRegistry::new();
    registry.register(
        StepSpec::new("initialize_households")
            .writes(["households", "land_use"])
            .coalesce(),
        initialize_households,
    )?;
    registry.register(
        StepSpec::new("initialize_persons")
            .reads(["households"])
            .writes(["persons"]),
        initialize_persons,
    )?;
    registry.register(
        StepSpec::new("tour_frequency")
            .reads(["persons"])
            .writes(["tours"])
            .chunked(ChunkTarget::over("persons").grouped_by("household_id")),
        tour_frequency,
    )?;
    registry.register(
        StepSpec::new("mode_choice")
            .reads(["tours", "households", "land_use"])
            .writes(["tours"])
            .chunked(ChunkTarget::over("tours").grouped_by("household_id")),
        mode_choice,
    )?;
    registry.register(
        StepSpec::new("write_summary")
            .reads(["households", "persons", "tours"])
            .writes(["summary"])
            .coalesce(),
        write_summary,
    )?;
    Ok(registry)
}

fn main() -> ExitCode {
    let steps: Vec<String> = [
        "initialize_households",
        "initialize_persons",
        "tour_frequency",
        "mode_choice",
        "write_summary",
    ]
    .into_iter()
    .map(String::from)
    .collect();

    let res = build_registry()
        .map_err(Into::into)
        .and_then(|registry| simrun::cli_main(registry, &steps));
    match res {
        Ok(summary) => {
            println!(
                "ran {} steps in {:.3?}; last checkpoint {:?}",
                summary.steps_run.len(),
                summary.elapsed,
                summary.last_checkpoint.map(|id| id.to_string())
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{}", report(&err));
            ExitCode::FAILURE
        }
    }
}
