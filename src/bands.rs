//! Grade classification policies.
//!
//! The pass/fail view and the section-distribution view cut the 75..80 range
//! differently and are kept as two separate tables.

use serde::Serialize;

pub const PASSING_GRADE: f64 = 75.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PassFail {
    Passing,
    Failing,
}

pub fn pass_fail(percent: f64) -> PassFail {
    if percent >= PASSING_GRADE {
        PassFail::Passing
    } else {
        PassFail::Failing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SectionBand {
    Excellent,
    Good,
    Average,
    Failing,
}

impl SectionBand {
    pub fn label(self) -> &'static str {
        match self {
            SectionBand::Excellent => "Excellent (90-100)",
            SectionBand::Good => "Good (80-89)",
            SectionBand::Average => "Average (75-79)",
            SectionBand::Failing => "Failing (<75)",
        }
    }
}

/// 90 and up Excellent, 80 Good, 75 Average, anything lower (or NaN) Failing.
pub fn section_band(percent: f64) -> SectionBand {
    if percent >= 90.0 {
        SectionBand::Excellent
    } else if percent >= 80.0 {
        SectionBand::Good
    } else if percent >= 75.0 {
        SectionBand::Average
    } else {
        SectionBand::Failing
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassFailTally {
    pub passing: usize,
    pub failing: usize,
}

impl PassFailTally {
    pub fn add(&mut self, percent: f64) {
        match pass_fail(percent) {
            PassFail::Passing => self.passing += 1,
            PassFail::Failing => self.failing += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.passing + self.failing
    }
}

impl FromIterator<f64> for PassFailTally {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut tally = PassFailTally::default();
        for p in iter {
            tally.add(p);
        }
        tally
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandTally {
    pub excellent: usize,
    pub good: usize,
    pub average: usize,
    pub failing: usize,
}

impl BandTally {
    pub fn add(&mut self, percent: f64) {
        match section_band(percent) {
            SectionBand::Excellent => self.excellent += 1,
            SectionBand::Good => self.good += 1,
            SectionBand::Average => self.average += 1,
            SectionBand::Failing => self.failing += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.excellent + self.good + self.average + self.failing
    }
}

impl FromIterator<f64> for BandTally {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut tally = BandTally::default();
        for p in iter {
            tally.add(p);
        }
        tally
    }
}
