use chrono::Utc;

use crate::parser::cron::CronSchedule;

pub fn cmd_cron(expression: &str, count: usize) -> anyhow::Result<()> {
    let schedule = CronSchedule::parse(expression)
        .map_err(|e| anyhow::anyhow!("Invalid cron expression '{expression}': {e}"))?;

    let upcoming = schedule.upcoming(Utc::now(), count.max(1));
    if upcoming.is_empty() {
        println!("'{schedule}' never fires.");
        return Ok(());
    }

    println!("Next {} run(s) of '{}' (UTC):", upcoming.len(), schedule);
    for at in upcoming {
        println!("  {}", at.format("%Y-%m-%d %H:%M:%S %a"));
    }

    Ok(())
}
