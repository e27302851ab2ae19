use crate::config::Config;
use crate::domain::{GlobalState, ProgramKind};

/// Chooses the program of the day. The first matching rule wins.
pub fn select(cfg: &Config, g: &GlobalState, soc: i32) -> ProgramKind {
    let b = &cfg.battery;

    // low battery and a failing survival forecast override the season
    if soc < b.reserve_soc {
        return ProgramKind::Modest;
    }
    if g.survive < 0 {
        return ProgramKind::Modest;
    }
    if g.season.is_summer() {
        return ProgramKind::Plenty;
    }
    if g.season.is_winter() && g.tomorrow < b.capacity_wh {
        return ProgramKind::Modest;
    }
    if g.success < 0 && g.akku < g.need_survive {
        return ProgramKind::Modest;
    }
    if g.tomorrow > g.today {
        return ProgramKind::Greedy;
    }
    if g.heating < 0 {
        return ProgramKind::Boilers;
    }
    ProgramKind::Plenty
}
